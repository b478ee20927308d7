use knit_package_manifest::WantedDependency;

/// How a package is reached from the project root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyFlags {
    /// Reached through a regular dependency.
    pub prod: bool,
    /// Reached through a dev dependency.
    pub dev: bool,
    /// Only reached through optional dependencies.
    pub optional: bool,
}

impl DependencyFlags {
    pub fn from_wanted(wanted_dependency: &WantedDependency) -> Self {
        let WantedDependency { dev, optional, .. } = *wanted_dependency;
        DependencyFlags { prod: !dev && !optional, dev, optional }
    }

    /// Combine the flags of two paths to the same package.
    ///
    /// A package stays optional only while every path to it is optional.
    pub fn merge(self, other: DependencyFlags) -> Self {
        DependencyFlags {
            prod: self.prod || other.prod,
            dev: self.dev || other.dev,
            optional: self.optional && other.optional,
        }
    }
}
