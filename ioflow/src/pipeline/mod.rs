//! Stage pipeline: probe decoding, per-identity state and the session that
//! drives them

pub mod probe_event;
pub mod session;
pub mod state;

pub use probe_event::{ProbeEvent, ProbeKind};
pub use session::{Session, SessionConfig, SessionStats};
pub use state::{BioState, Extent, FsDeltas, Phase, RequestState, RequestTiming, SyscallState};
