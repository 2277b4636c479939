pub mod seal;

use crate::payload::BundleVersion;
use std::path::PathBuf;

/// MIME token written into `mime.txt` for an Artifact Dependency Graph set.
pub const MIME_ADG: &str = "application/vnd.cc.bigtent";

/// MIME token written into `mime.txt` for a deployment-events file.
pub const MIME_DEPLOYMENT_EVENTS: &str = "application/vnd.info.deployevent";

#[derive(Debug)]
pub enum Action {
    Seal {
        jwt: Option<String>,
        uuid: Option<String>,
        input: PathBuf,
        mime: &'static str,
        encrypt_only: bool,
        skip_key: bool,
        comment: Option<String>,
        output: Option<PathBuf>,
        version: BundleVersion,
    },
}
