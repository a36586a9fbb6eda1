mod identity;
mod profile;
mod protocol;
mod request;
mod turn;

pub use identity::{RuntimePaths, current_uid, current_user, default_client_id, derive_instance_id};
pub use profile::{InvalidValue, OutputFormat, Profile, ProfileParams, RuntimeConfig, lenient_profile};
pub use protocol::{
    ConfigAction, ConfigOverlay, ErrorCode, QueryMetadata, RequestKind, ResponseStatus,
    WorkerReply, WorkerRequest, WorkerResponse,
};
pub use request::{ClientCommand, ClientRequest, DaemonReply, RequestError};
pub use turn::{ConversationTurn, Role, TurnWindow};
