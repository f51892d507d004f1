use thiserror::Error;

use crate::types::{PortNo, SwitchId};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("switch {0:016x} not found")]
    SwitchNotFound(SwitchId),

    #[error("port {1:08x} not found on switch {0:016x}")]
    PortNotFound(SwitchId, PortNo),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("datapath error: {0}")]
    Datapath(String),
}

impl RouterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SwitchNotFound(_) | Self::PortNotFound(..))
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
