use crate::program::{BlockId, CfgId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CuldesacError {
    #[error("program contains no CFG")]
    NoCfg,
    #[error("CFG {0:?} referenced but not present in the program")]
    UnknownCfg(CfgId),
    #[error("block {0:?} referenced but not present in its CFG")]
    UnknownBlock(BlockId),
    #[error("CFG {0:?} has no entry block")]
    MissingEntry(CfgId),
    #[error("CFG {0:?} has no exit block")]
    MissingExit(CfgId),
    #[error("stack pointer register not identified by the platform context")]
    SpNotIdentified,
    #[error("stack pointer of \"{0}\" cannot equal sp+0 at exit")]
    SpLost(String),
    #[error("loop annotations are inconsistent: edge {0:?} exits a block that is not a loop header")]
    BadLoopExit(BlockId),
    #[error("unsupported analysis version {0} (expected 1-3)")]
    BadVersion(u8),
    #[error("malformed program input: {0}")]
    MalformedInput(String),
    #[error("could not construct an SMT solver: {0}")]
    Solver(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
