/// Accounts to stop and to start so the running set matches `desired`.
/// An account whose settings changed appears in both lists.
#[derive(Debug, Default, PartialEq, Eq)]
struct SupervisionPlan {
    stop: Vec<i64>,
    start: Vec<i64>,
}

fn plan_supervision<F: PartialEq>(
    current: &HashMap<i64, F>,
    desired: &HashMap<i64, F>,
) -> SupervisionPlan {
    let mut plan = SupervisionPlan::default();
    for (id, fingerprint) in current {
        match desired.get(id) {
            Some(wanted) if wanted == fingerprint => {}
            _ => plan.stop.push(*id),
        }
    }
    for (id, fingerprint) in desired {
        match current.get(id) {
            Some(existing) if existing == fingerprint => {}
            _ => plan.start.push(*id),
        }
    }
    plan.stop.sort_unstable();
    plan.start.sort_unstable();
    plan
}

fn format_timestamp(unix: i64) -> String {
    if unix <= 0 {
        return "never".to_string();
    }
    OffsetDateTime::from_unix_timestamp(unix)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| unix.to_string())
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        None => default,
    }
}
