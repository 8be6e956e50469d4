//! The build collaborator
//!
//! Building the installable package is somebody else's job; the runner only
//! consumes the finished artifact through [`BuildArtifact`]. The CLI wires in
//! [`PrebuiltApk`]; an IDE would implement the trait over its own build
//! pipeline and source maps.

use std::fmt;
use std::path::PathBuf;

/// What kind of component the sketch was built as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Regular interactive app
    App,
    /// Live wallpaper service
    Wallpaper,
    /// Watch face service
    WatchFace,
    /// VR app
    Vr,
}

impl ComponentKind {
    pub fn is_watch_face(self) -> bool {
        self == ComponentKind::WatchFace
    }

    /// Services the user picks from a system chooser; installing them is the
    /// whole deployment and no launch intent is sent.
    pub fn installs_only(self) -> bool {
        matches!(self, ComponentKind::Wallpaper | ComponentKind::WatchFace)
    }
}

/// A crash mapped back to the sketch's own source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SketchError {
    pub message: String,
    pub file: String,
    /// Zero-based line in `file`
    pub line: u32,
}

impl fmt::Display for SketchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.message, self.file, self.line + 1)
    }
}

/// Interface of the (out-of-scope) build pipeline
pub trait BuildArtifact: Send + Sync {
    /// Path of the installable package, if the build produced one
    fn artifact_path(&self) -> Option<PathBuf>;

    /// Package name the sketch was built under
    fn package_name(&self) -> String;

    /// Class name of the main entry point
    fn main_class_name(&self) -> String;

    fn component_kind(&self) -> ComponentKind;

    fn uses_accelerated_graphics(&self) -> bool;

    fn is_wearable(&self) -> bool;

    /// Map a raw crash line plus a `file:line` extracted from the stack
    /// trace back to a location in the sketch's source
    fn map_to_source(&self, exception_line: &str, file: &str, line: u32) -> Option<SketchError>;
}

/// An already-built APK, as handed to the CLI
///
/// Has no source maps, so crashes surface with the raw exception text.
#[derive(Debug, Clone)]
pub struct PrebuiltApk {
    pub apk: PathBuf,
    pub package: String,
    pub main_class: String,
    pub component: ComponentKind,
    pub wear: bool,
    pub accelerated: bool,
}

impl BuildArtifact for PrebuiltApk {
    fn artifact_path(&self) -> Option<PathBuf> {
        self.apk.exists().then(|| self.apk.clone())
    }

    fn package_name(&self) -> String {
        self.package.clone()
    }

    fn main_class_name(&self) -> String {
        self.main_class.clone()
    }

    fn component_kind(&self) -> ComponentKind {
        self.component
    }

    fn uses_accelerated_graphics(&self) -> bool {
        self.accelerated
    }

    fn is_wearable(&self) -> bool {
        self.wear
    }

    fn map_to_source(&self, _exception_line: &str, _file: &str, _line: u32) -> Option<SketchError> {
        None
    }
}
