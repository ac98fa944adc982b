use super::method::{DeploymentMethod, PurgeSummary, SupportContext, Unsupported};
use std::{io, path::Path};

/// Records deployments without touching the filesystem. Useful for dry runs
/// and for games that read mods straight from the staging folder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMethod;

impl DeploymentMethod for NullMethod {
    fn id(&self) -> &'static str {
        "null"
    }

    fn name(&self) -> &'static str {
        "No Deployment"
    }

    fn is_supported(&self, _ctx: &SupportContext) -> Option<Unsupported> {
        None
    }

    fn link_file(&self, _dest: &Path, _source: &Path) -> io::Result<()> {
        Ok(())
    }

    fn unlink_file(&self, _dest: &Path, _source: &Path) -> io::Result<()> {
        Ok(())
    }

    fn is_link(&self, _dest: &Path, _source: &Path) -> bool {
        true
    }

    fn can_restore(&self) -> bool {
        false
    }

    fn purge_links(&self, _staging_root: &Path, _dest_root: &Path) -> io::Result<PurgeSummary> {
        Ok(PurgeSummary::default())
    }
}
