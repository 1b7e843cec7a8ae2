/// Folders are claimed before files so parents exist remotely first.
pub const PRIORITY_FOLDER: i32 = 10;
pub const PRIORITY_FILE: i32 = 0;

/// A persisted request to reconcile one local path, handed out once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub id: i64,
    pub account_id: i64,
    pub watcher_id: i64,
    pub file_path: String,
    pub root_node_id: String,
    pub priority: i32,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    pub account_id: i64,
    pub watcher_id: i64,
    pub file_path: String,
    pub root_node_id: String,
    pub priority: i32,
}

impl NewWorkItem {
    pub fn for_path(
        account_id: i64,
        watcher_id: i64,
        file_path: impl Into<String>,
        root_node_id: impl Into<String>,
        is_folder: bool,
    ) -> Self {
        Self {
            account_id,
            watcher_id,
            file_path: file_path.into(),
            root_node_id: root_node_id.into(),
            priority: if is_folder {
                PRIORITY_FOLDER
            } else {
                PRIORITY_FILE
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folders_outrank_files() {
        let folder = NewWorkItem::for_path(1, 2, "/sync/docs", "root", true);
        let file = NewWorkItem::for_path(1, 2, "/sync/docs/a.txt", "root", false);
        assert!(folder.priority > file.priority);
        assert_eq!(file.root_node_id, "root");
    }
}
