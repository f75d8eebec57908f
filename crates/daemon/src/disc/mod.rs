//! Everything that touches the optical drive.

pub mod model;
pub mod monitor;
pub mod ripper;
pub mod robot;
pub mod selection;

pub use model::{DiscInfo, DiscType, Title, Track, TrackType};
pub use monitor::{DiscMonitor, DiscProbe, MakemkvDriveProbe, MonitorError};
pub use ripper::{
    sanitize_filename, DiscError, DiscRipper, DiscScan, MakemkvRipper, RipProgress, RipperSettings,
};
pub use robot::{parse_robot_output, parse_titles, RobotParser, RobotScan};
pub use selection::{
    parse_label_hints, select_main_title, AudioSelection, ContentType, LabelHints, TitleChoice,
    TitleRole, TitleSelection, TitleSelector,
};
