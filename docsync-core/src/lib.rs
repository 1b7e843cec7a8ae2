mod client;

pub use client::{
    ApiErrorClass, FileUpload, Node, NodePage, NodesClient, NodesError, PathInfo, parse_timestamp,
};
