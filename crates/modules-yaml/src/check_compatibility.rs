use crate::{Modules, LAYOUT_VERSION};
use derive_more::{Display, Error};
use miette::Diagnostic;
use std::path::{Path, PathBuf};

/// Settings of the current install that must match those `node_modules` was created with.
#[derive(Debug, Clone, Copy)]
pub struct CompatibilityOptions<'a> {
    pub store_dir: &'a Path,
    pub modules_dir: &'a Path,
    pub independent_leaves: bool,
    pub shamefully_flatten: bool,
}

/// Error when an existing `node_modules` can't be updated with the current settings.
#[derive(Debug, Display, Error, Diagnostic)]
pub enum CompatibilityError {
    #[display("The node_modules at {modules_dir:?} was created with layout version {found}, expected {expected}")]
    #[diagnostic(
        code(knit_modules_yaml::layout_version),
        help("Run the install with --force to recreate node_modules")
    )]
    LayoutVersion { modules_dir: PathBuf, found: u32, expected: u32 },

    #[display("Unexpected store location. The dependencies at {modules_dir:?} are currently linked from the store at {recorded:?}, not {configured:?}")]
    #[diagnostic(
        code(knit_modules_yaml::unexpected_store),
        help("Use the store the modules were installed with, or run the install with --force to recreate node_modules")
    )]
    UnexpectedStore { modules_dir: PathBuf, recorded: String, configured: PathBuf },

    #[display("This node_modules was {} with the independent-leaves option", installed_with_str(*installed_with))]
    #[diagnostic(
        code(knit_modules_yaml::independent_leaves),
        help("Match the option or run the install with --force to recreate node_modules")
    )]
    IndependentLeaves {
        #[error(not(source))]
        installed_with: bool,
    },

    #[display("This node_modules was {} with the shamefully-flatten option", installed_with_str(*installed_with))]
    #[diagnostic(
        code(knit_modules_yaml::shamefully_flatten),
        help("Match the option or run the install with --force to recreate node_modules")
    )]
    ShamefullyFlatten {
        #[error(not(source))]
        installed_with: bool,
    },
}

fn installed_with_str(installed_with: bool) -> &'static str {
    if installed_with {
        "installed"
    } else {
        "not installed"
    }
}

impl Modules {
    /// Check that the modules directory can be reused as is.
    pub fn check_compatibility(&self, options: &CompatibilityOptions) -> Result<(), CompatibilityError> {
        let CompatibilityOptions { store_dir, modules_dir, independent_leaves, shamefully_flatten } =
            *options;
        if self.independent_leaves != independent_leaves {
            return Err(CompatibilityError::IndependentLeaves { installed_with: self.independent_leaves });
        }
        if self.shamefully_flatten != shamefully_flatten {
            return Err(CompatibilityError::ShamefullyFlatten { installed_with: self.shamefully_flatten });
        }
        if self.layout_version != LAYOUT_VERSION {
            return Err(CompatibilityError::LayoutVersion {
                modules_dir: modules_dir.to_path_buf(),
                found: self.layout_version,
                expected: LAYOUT_VERSION,
            });
        }
        if !same_store(&self.store, &store_dir.to_string_lossy(), cfg!(windows)) {
            return Err(CompatibilityError::UnexpectedStore {
                modules_dir: modules_dir.to_path_buf(),
                recorded: self.store.clone(),
                configured: store_dir.to_path_buf(),
            });
        }
        Ok(())
    }
}

/// Windows paths are case insensitive, drive letters included.
fn same_store(recorded: &str, configured: &str, windows: bool) -> bool {
    let normalize = |path: &str| {
        let path = path.trim_end_matches(['/', '\\']);
        if windows {
            path.replace('/', "\\").to_lowercase()
        } else {
            path.to_string()
        }
    };
    normalize(recorded) == normalize(configured)
}
