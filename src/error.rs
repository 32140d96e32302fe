//! Error types for the graph primitive and the playback backends

use thiserror::Error;

use crate::graph::{NodeId, PortId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("no factory available for node kind '{0}'")]
    MissingFactory(String),
    #[error("node {0} does not exist")]
    UnknownNode(NodeId),
    #[error("port {0} does not exist")]
    UnknownPort(PortId),
    #[error("node {node} has no port named '{name}'")]
    NoSuchPort { node: NodeId, name: String },
    #[error("failed to link {src} -> {sink}")]
    Link { src: PortId, sink: PortId },
    #[error("node {node} already belongs to bin {parent}")]
    ForeignParent { node: NodeId, parent: NodeId },
    #[error("node {0} is not a bin")]
    NotABin(NodeId),
    #[error("state change of node {0} failed")]
    StateChange(NodeId),
    #[error("source '{0}' could not be resolved")]
    Resolution(String),
    #[error("source id must not be empty")]
    EmptySourceId,
    #[error("sink port {0} is already attached")]
    AlreadyAttached(PortId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlayerError {
    #[error("{0}")]
    Graph(#[from] GraphError),
    #[error("sink has not been created")]
    NoSink,
    #[error("no media stream attached to the player")]
    NoStream,
    #[error("failed to attach to source '{0}'")]
    Attach(String),
    #[error("this backend cannot play a {0} resource")]
    UnsupportedResource(&'static str),
}
