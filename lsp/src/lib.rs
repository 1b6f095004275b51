//! Bridge between an editor's LSP client and language servers running
//! inside a container whose filesystem namespace differs from the editor's.

pub mod codec;
pub mod languages;
pub mod message;
pub mod protocol;
pub mod rewrite;
pub mod runner;
pub mod translate;
pub mod types;

mod bridge;
mod error;
mod registry;

pub use bridge::ClientHandle;
pub use error::BridgeError;
pub use languages::{LanguageRegistry, ServerCatalog, find_root};
pub use message::{Message, MessageKind, ProtocolError, RequestId, ResponseError};
pub use registry::Registry;
pub use rewrite::PayloadRewriter;
pub use runner::{CommandOutput, CommandRunner, ContainerCli, ProcessControl, RunnerError, ServerProcess};
pub use translate::{
    Direction, MappingError, PathTranslator, Strategy, TranslationMode, WorkspaceMapping,
};
pub use types::{
    Availability, BridgeTimeouts, BufferId, BufferRef, ClientEvent, ClientOptions, ClientState,
    HealthReport, RegistryOptions, ServerAvailability, ServerConfig, ServerConfigError, ServerSpec,
};
