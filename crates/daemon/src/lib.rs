//! Spindle
//!
//! Watches an optical drive, rips each inserted disc with MakeMKV, identifies
//! it, hands the rips to an encoder and files the results into a media
//! library. Every disc is tracked as a persistent queue item.

pub mod daemon;
pub mod disc;
pub mod encode;
pub mod identify;
pub mod organize;
pub mod queue;
pub mod rip_spec;
pub mod startup;
pub mod status_server;
pub mod tool;
pub mod workflow;

pub use spindle_config as config;
pub use spindle_config::Config;
pub use daemon::{Collaborators, Daemon, DaemonError};
pub use disc::{DiscError, DiscInfo, DiscRipper, DiscType, MakemkvRipper, Title, Track, TrackType};
pub use encode::{CommandEncoder, EncodeError, EncodeEvent, EncodeRequest, Encoder};
pub use identify::{Identification, IdentifyError, IdentifyRequest, Identifier, MediaInfo, MediaType};
pub use organize::{LibraryOrganizer, OrganizeError, Organizer};
pub use queue::{QueueError, QueueItem, QueueStats, QueueStatus, QueueStore};
pub use rip_spec::RipSpec;
pub use startup::{check_tool_available, run_startup_checks, StartupError};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use tool::{run_tool, ToolError};
pub use workflow::{Workflow, WorkflowError, WorkflowSettings};
