pub mod command;
pub mod dispatcher;

pub use command::{
    AgentAnswer, AgentCommand, AttachIsoPayload, CopyToSecondaryPayload, DestroyPoolCopyPayload,
    DownloadToPoolPayload, FetchTemplatePayload, UploadToUrlPayload,
};
pub use dispatcher::{AgentDispatcher, HttpAgentDispatcher};
