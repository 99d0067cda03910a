pub mod protocol;
pub mod framer;

// Re-exports
pub use framer::{Frame, Framer};
pub use protocol::{
    ClientCall, ClientFrame, LoginParams, RpcMessage,
    StratumError, StratumResponse
};
