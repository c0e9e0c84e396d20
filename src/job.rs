//! Run configuration: the validated, strongly typed snapshot of one render job.
//!
//! A job is described in TOML, deserialized into a loose [`JobFile`] and then
//! converted into a [`RunConfiguration`] whose mutually exclusive modes are
//! enums. Every check here runs before any process or file is touched.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Which part of the project to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Composition(String),
    /// 1-based render queue item index.
    QueueIndex(u32),
}

/// Chunk selection over a frame spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSelection {
    pub size: u32,
    /// 0-based chunk index.
    pub index: u32,
}

/// Which frames to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameScope {
    /// Inclusive start/end pair.
    Range { start: i64, end: i64 },
    /// Frame spec like "1-100,150-200", optionally narrowed to one chunk.
    Spec {
        frames: String,
        chunk: Option<ChunkSelection>,
    },
}

/// How many worker processes the external worker should run.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcurrencyMode {
    Fixed(u32),
    /// The worker picks the process count itself within these hints.
    Auto {
        max_concurrency: u32,
        ram_per_process_gb: f64,
        mfr_threads: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlags {
    pub sound: bool,
    pub disable_mfr: bool,
    pub no_scratch: bool,
    pub stage_project: bool,
    pub kill_on_fail: bool,
    pub disable_affinity: bool,
    pub output_is_pattern: bool,
    pub dry_run: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            sound: true,
            disable_mfr: false,
            no_scratch: false,
            stage_project: true,
            kill_on_fail: false,
            disable_affinity: false,
            output_is_pattern: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathOverrides {
    pub renderer: Option<PathBuf>,
    pub after_effects_dir: Option<PathBuf>,
    pub scratch_root: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub numa_map: Option<PathBuf>,
    pub rs_template: Option<String>,
    pub om_template: Option<String>,
}

/// Immutable snapshot of the settings for one launch.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfiguration {
    pub project: PathBuf,
    pub output: PathBuf,
    pub target: TargetSelector,
    pub frames: FrameScope,
    pub concurrency: ConcurrencyMode,
    pub features: FeatureFlags,
    pub overrides: PathOverrides,
}

// --- On-disk job file ---

/// Job file as written by the user or a host form, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobFile {
    pub project: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub target: TargetTable,
    pub frames: FramesTable,
    pub concurrency: ConcurrencyTable,
    pub features: FeaturesTable,
    pub overrides: PathOverrides,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetTable {
    pub composition: Option<String>,
    pub queue_index: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FramesTable {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub spec: Option<String>,
    pub chunk_size: Option<u32>,
    pub chunk_index: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyTable {
    /// Fixed process count; absent or 0 selects auto mode.
    pub processes: Option<u32>,
    pub max_concurrency: u32,
    pub ram_per_process_gb: f64,
    pub mfr_threads: u32,
}

impl Default for ConcurrencyTable {
    fn default() -> Self {
        Self {
            processes: None,
            max_concurrency: 24,
            ram_per_process_gb: 32.0,
            mfr_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeaturesTable {
    pub sound: bool,
    pub disable_mfr: bool,
    pub no_scratch: bool,
    pub stage_project: bool,
    pub kill_on_fail: bool,
    pub disable_affinity: bool,
    pub output_is_pattern: bool,
    pub dry_run: bool,
}

impl Default for FeaturesTable {
    fn default() -> Self {
        let f = FeatureFlags::default();
        Self {
            sound: f.sound,
            disable_mfr: f.disable_mfr,
            no_scratch: f.no_scratch,
            stage_project: f.stage_project,
            kill_on_fail: f.kill_on_fail,
            disable_affinity: f.disable_affinity,
            output_is_pattern: f.output_is_pattern,
            dry_run: f.dry_run,
        }
    }
}

/// Configuration problems, reported before anything is launched.
#[derive(Debug)]
pub enum ValidationError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    MissingProject,
    ProjectNotFound(PathBuf),
    MissingOutput,
    MissingTarget,
    TargetConflict,
    EmptyComposition,
    QueueIndexZero,
    MissingFrameScope,
    FrameScopeConflict,
    IncompleteRange,
    InvalidRange { start: i64, end: i64 },
    InvalidFrameSpec { spec: String, reason: String },
    IncompleteChunk,
    ChunkSizeZero,
    ChunkNotFound { index: u32, count: usize },
    MaxConcurrencyZero,
    InvalidRamHint(f64),
    OverrideNotFound { name: &'static str, path: PathBuf },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Read { path, source } => {
                write!(f, "failed to read job file {}: {source}", path.display())
            }
            ValidationError::Parse { path, source } => {
                write!(f, "failed to parse job file {}: {source}", path.display())
            }
            ValidationError::MissingProject => write!(f, "no project file set; add `project = ...`"),
            ValidationError::ProjectNotFound(p) => {
                write!(f, "project file {} does not exist", p.display())
            }
            ValidationError::MissingOutput => write!(f, "no output path set; add `output = ...`"),
            ValidationError::MissingTarget => write!(
                f,
                "no render target; set [target] composition or [target] queue_index"
            ),
            ValidationError::TargetConflict => write!(
                f,
                "set either [target] composition or [target] queue_index, not both"
            ),
            ValidationError::EmptyComposition => write!(f, "composition name is empty"),
            ValidationError::QueueIndexZero => {
                write!(f, "queue_index is 1-based; 0 is not a render queue item")
            }
            ValidationError::MissingFrameScope => write!(
                f,
                "no frames selected; set [frames] start/end or [frames] spec"
            ),
            ValidationError::FrameScopeConflict => write!(
                f,
                "set either [frames] start/end or [frames] spec, not both"
            ),
            ValidationError::IncompleteRange => {
                write!(f, "[frames] start and end must be given together")
            }
            ValidationError::InvalidRange { start, end } => {
                write!(f, "frame range {start}-{end} is invalid (start must be <= end, >= 0)")
            }
            ValidationError::InvalidFrameSpec { spec, reason } => {
                write!(f, "invalid frame spec {spec:?}: {reason}")
            }
            ValidationError::IncompleteChunk => {
                write!(f, "chunk_size and chunk_index must be given together")
            }
            ValidationError::ChunkSizeZero => write!(f, "chunk_size must be greater than 0"),
            ValidationError::ChunkNotFound { index, count } => {
                write!(f, "chunk index {index} not found ({count} chunk(s) available)")
            }
            ValidationError::MaxConcurrencyZero => {
                write!(f, "max_concurrency must be greater than 0")
            }
            ValidationError::InvalidRamHint(v) => {
                write!(f, "ram_per_process_gb must be positive, got {v}")
            }
            ValidationError::OverrideNotFound { name, path } => {
                write!(f, "{name} override {} does not exist", path.display())
            }
        }
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ValidationError::Read { source, .. } => Some(source),
            ValidationError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl RunConfiguration {
    /// Load and convert a job file. Does not check the filesystem; call
    /// [`RunConfiguration::validate`] before launching.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ValidationError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: JobFile = toml::from_str(&contents).map_err(|e| ValidationError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_job_file(file)
    }

    pub fn from_job_file(file: JobFile) -> Result<Self, ValidationError> {
        let project = file.project.ok_or(ValidationError::MissingProject)?;
        let output = file.output.ok_or(ValidationError::MissingOutput)?;

        let target = match (file.target.composition, file.target.queue_index) {
            (Some(_), Some(_)) => return Err(ValidationError::TargetConflict),
            (Some(name), None) => TargetSelector::Composition(name),
            (None, Some(index)) => TargetSelector::QueueIndex(index),
            (None, None) => return Err(ValidationError::MissingTarget),
        };

        let fr = file.frames;
        let has_range = fr.start.is_some() || fr.end.is_some();
        let frames = match (has_range, fr.spec) {
            (true, Some(_)) => return Err(ValidationError::FrameScopeConflict),
            (true, None) => match (fr.start, fr.end) {
                (Some(start), Some(end)) => FrameScope::Range { start, end },
                _ => return Err(ValidationError::IncompleteRange),
            },
            (false, Some(frames)) => {
                let chunk = match (fr.chunk_size, fr.chunk_index) {
                    (Some(size), Some(index)) => Some(ChunkSelection { size, index }),
                    (None, None) => None,
                    _ => return Err(ValidationError::IncompleteChunk),
                };
                FrameScope::Spec { frames, chunk }
            }
            (false, None) => return Err(ValidationError::MissingFrameScope),
        };

        let c = file.concurrency;
        let concurrency = match c.processes {
            Some(n) if n > 0 => ConcurrencyMode::Fixed(n),
            _ => ConcurrencyMode::Auto {
                max_concurrency: c.max_concurrency,
                ram_per_process_gb: c.ram_per_process_gb,
                mfr_threads: c.mfr_threads,
            },
        };

        let f = file.features;
        let features = FeatureFlags {
            sound: f.sound,
            disable_mfr: f.disable_mfr,
            no_scratch: f.no_scratch,
            stage_project: f.stage_project,
            kill_on_fail: f.kill_on_fail,
            disable_affinity: f.disable_affinity,
            output_is_pattern: f.output_is_pattern,
            dry_run: f.dry_run,
        };

        Ok(Self {
            project,
            output,
            target,
            frames,
            concurrency,
            features,
            overrides: file.overrides,
        })
    }

    /// Check values and referenced paths.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.project.as_os_str().is_empty() {
            return Err(ValidationError::MissingProject);
        }
        if !self.project.exists() {
            return Err(ValidationError::ProjectNotFound(self.project.clone()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(ValidationError::MissingOutput);
        }

        match &self.target {
            TargetSelector::Composition(name) if name.trim().is_empty() => {
                return Err(ValidationError::EmptyComposition)
            }
            TargetSelector::QueueIndex(0) => return Err(ValidationError::QueueIndexZero),
            _ => {}
        }

        match &self.frames {
            FrameScope::Range { start, end } => {
                if *start < 0 || end < start {
                    return Err(ValidationError::InvalidRange {
                        start: *start,
                        end: *end,
                    });
                }
            }
            FrameScope::Spec { frames, chunk } => {
                let intervals = parse_frame_spec(frames)?;
                if let Some(chunk) = chunk {
                    select_chunk(&intervals, *chunk)?;
                }
            }
        }

        if let ConcurrencyMode::Auto {
            max_concurrency,
            ram_per_process_gb,
            ..
        } = &self.concurrency
        {
            if *max_concurrency == 0 {
                return Err(ValidationError::MaxConcurrencyZero);
            }
            if ram_per_process_gb.is_nan() || *ram_per_process_gb <= 0.0 {
                return Err(ValidationError::InvalidRamHint(*ram_per_process_gb));
            }
        }

        let o = &self.overrides;
        let must_exist = [
            ("renderer", &o.renderer),
            ("after_effects_dir", &o.after_effects_dir),
            ("env_file", &o.env_file),
            ("numa_map", &o.numa_map),
        ];
        for (name, path) in must_exist {
            if let Some(path) = path {
                if !path.exists() {
                    return Err(ValidationError::OverrideNotFound {
                        name,
                        path: path.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Frame range the whole session covers, used when no per-child ranges
    /// are known yet. `None` when the frame spec does not parse.
    pub fn session_range(&self) -> Option<(i64, i64)> {
        match &self.frames {
            FrameScope::Range { start, end } => Some((*start, *end)),
            FrameScope::Spec { frames, chunk } => {
                let intervals = parse_frame_spec(frames).ok()?;
                match chunk {
                    Some(chunk) => select_chunk(&intervals, *chunk).ok(),
                    None => {
                        let first = intervals.first()?.0;
                        let last = intervals.last()?.1;
                        Some((first, last))
                    }
                }
            }
        }
    }
}

/// Parse a frame spec into sorted, merged, inclusive intervals.
///
/// Parts are `N` or `A-B`, separated by commas; reversed pairs are swapped
/// and overlapping or adjacent parts merge.
pub fn parse_frame_spec(spec: &str) -> Result<Vec<(i64, i64)>, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidFrameSpec {
        spec: spec.to_string(),
        reason,
    };
    let parse_num = |s: &str| -> Result<i64, ValidationError> {
        s.trim()
            .parse::<i64>()
            .map_err(|_| invalid(format!("{:?} is not a frame number", s.trim())))
    };

    let mut parts = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (a, b) = match part.split_once('-') {
            Some((a, b)) => (parse_num(a)?, parse_num(b)?),
            None => {
                let n = parse_num(part)?;
                (n, n)
            }
        };
        parts.push(if b < a { (b, a) } else { (a, b) });
    }
    if parts.is_empty() {
        return Err(invalid("no frames".to_string()));
    }

    parts.sort_unstable();
    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(parts.len());
    for (a, b) in parts {
        match merged.last_mut() {
            Some(last) if last.1.checked_add(1).map_or(true, |next| a <= next) => {
                last.1 = last.1.max(b)
            }
            _ => merged.push((a, b)),
        }
    }
    if let Some((a, b)) = merged
        .iter()
        .find(|(a, b)| b.checked_sub(*a).and_then(|d| d.checked_add(1)).is_none())
    {
        return Err(invalid(format!("{a}-{b} holds too many frames")));
    }
    Ok(merged)
}

/// The `index`-th run of at most `size` contiguous frames, counting chunks
/// across intervals in order. Chunks never span a gap between intervals.
fn select_chunk(
    intervals: &[(i64, i64)],
    chunk: ChunkSelection,
) -> Result<(i64, i64), ValidationError> {
    if chunk.size == 0 {
        return Err(ValidationError::ChunkSizeZero);
    }
    let size = u64::from(chunk.size);
    let mut remaining = u64::from(chunk.index);
    let mut count = 0u64;
    let mut found = None;
    for &(a, b) in intervals {
        if b < a {
            continue;
        }
        let chunks = b.abs_diff(a).saturating_add(1).div_ceil(size);
        if found.is_none() {
            if remaining < chunks {
                let start = a.saturating_add_unsigned(remaining * size);
                let end = start.saturating_add_unsigned(size - 1).min(b);
                found = Some((start, end));
            } else {
                remaining -= chunks;
            }
        }
        count = count.saturating_add(chunks);
    }
    found.ok_or(ValidationError::ChunkNotFound {
        index: chunk.index,
        count: usize::try_from(count).unwrap_or(usize::MAX),
    })
}
