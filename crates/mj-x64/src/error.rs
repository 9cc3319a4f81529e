#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported IR opcode: {0}")]
    UnsupportedNode(String),

    #[error("unsupported mode {mode} on node {node}")]
    UnsupportedMode { node: u32, mode: String },

    #[error("malformed IR graph: {0}")]
    MalformedGraph(String),

    #[error("invariant violation at node {node}: {message}")]
    InvariantViolation { node: u32, message: String },

    #[error("no register satisfies the hard constraint on v{0}")]
    ConstraintCollision(u32),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
