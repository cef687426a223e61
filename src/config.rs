//! Configuration for the scan pipeline.
//!
//! Settings load from a TOML file; every field has a default so an empty
//! (or missing) file yields a working configuration. Paths are expanded
//! with `shellexpand` so `~` and environment variables work in config
//! values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sniff::ImageFormat;

/// Hash-cache operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HashingMode {
    /// No cache at all.
    #[default]
    Disabled,
    /// Local flat-file cache, spam learning only.
    Local,
    /// Local flat-file cache, spam and ham learning.
    LocalLearnHam,
    /// Shared SQLite backend, spam and ham learning.
    Shared,
}

impl HashingMode {
    pub fn enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn learns_ham(&self) -> bool {
        matches!(self, Self::LocalLearnHam | Self::Shared)
    }
}

/// Workspace retention policy, graded by the per-message error counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeepWorkspace {
    #[default]
    Never,
    OnError,
    Always,
}

/// Scoring and matching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Rule name reported to the host for the final score.
    pub rule_name: String,
    /// Match count at which an image counts as spam.
    pub required_count: u32,
    /// Score awarded when the required count is met.
    pub base_score: f32,
    /// Score added per occurrence beyond the required count.
    pub add_score: f32,
    /// Weight applied to a match report won by the despaced pass.
    pub despaced_factor: f32,
    /// Score sub-threshold matches when set (ham scoring).
    pub score_ham: bool,
    /// Stop scanning lines for a word after its first hit.
    pub unique_match: bool,
    /// Strip digits from words and OCR output before matching.
    pub strip_numbers: bool,
    /// Stop trying further scansets once one meets the required count.
    pub minimal_scanset: bool,
    /// Reward effective scansets by reordering them.
    pub autosort: bool,
    /// Upper bound for a scanset hit counter.
    pub autosort_buffer: u32,
    /// Skip the whole pipeline when the host score is already above this.
    pub autodisable_score: f32,
    /// Skip the whole pipeline when the host score is already below this.
    pub autodisable_negative_score: f32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            rule_name: "OCRSIEVE".to_string(),
            required_count: 2,
            base_score: 4.0,
            add_score: 1.0,
            despaced_factor: 0.5,
            score_ham: false,
            unique_match: true,
            strip_numbers: false,
            minimal_scanset: true,
            autosort: true,
            autosort_buffer: 10,
            autodisable_score: 100.0,
            autodisable_negative_score: -100.0,
        }
    }
}

/// Per-format gate bounds and enable flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatConfig {
    pub gif: bool,
    pub jpeg: bool,
    pub png: bool,
    pub bmp: bool,
    pub tiff: bool,
    pub pdf: bool,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Abort an image whose converted raster exceeds this many bytes.
    pub max_raster_bytes: u64,
    /// Abort a PDF with more pages than this.
    pub max_pdf_pages: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            gif: true,
            jpeg: true,
            png: true,
            bmp: true,
            tiff: true,
            pdf: true,
            min_width: 40,
            min_height: 20,
            max_width: 3000,
            max_height: 3000,
            max_raster_bytes: 4 * 1024 * 1024,
            max_pdf_pages: 10,
        }
    }
}

impl FormatConfig {
    pub fn is_enabled(&self, format: ImageFormat) -> bool {
        match format {
            ImageFormat::Gif => self.gif,
            ImageFormat::Jpeg => self.jpeg,
            ImageFormat::Png => self.png,
            ImageFormat::Bmp => self.bmp,
            ImageFormat::Tiff => self.tiff,
            ImageFormat::Pdf => self.pdf,
        }
    }
}

/// External tool executables and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Wall-clock limit for a single tool invocation, in seconds.
    pub timeout_secs: u64,
    /// Wall-clock limit for a whole message, in seconds.
    pub global_timeout_secs: u64,
    pub gif_info: String,
    pub gif_fix: String,
    pub gif_deanim: String,
    pub gif_interlace: String,
    pub gif_to_pnm: String,
    pub jpeg_to_pnm: String,
    pub png_to_pnm: String,
    pub bmp_to_pnm: String,
    pub tiff_to_pnm: String,
    pub pdf_info: String,
    pub pdf_to_ps: String,
    pub ps_to_raster: String,
    /// Marker string in the fix tool's stderr that flags corruption.
    pub gif_corruption_marker: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            global_timeout_secs: 120,
            gif_info: "giftext".to_string(),
            gif_fix: "giffix".to_string(),
            gif_deanim: "gifasm".to_string(),
            gif_interlace: "gifinter".to_string(),
            gif_to_pnm: "giftopnm".to_string(),
            jpeg_to_pnm: "jpegtopnm".to_string(),
            png_to_pnm: "pngtopnm".to_string(),
            bmp_to_pnm: "bmptopnm".to_string(),
            tiff_to_pnm: "tifftopnm".to_string(),
            pdf_info: "pdfinfo".to_string(),
            pdf_to_ps: "pdftops".to_string(),
            ps_to_raster: "gs".to_string(),
            gif_corruption_marker: "GIF-LIB error".to_string(),
        }
    }
}

impl ToolsConfig {
    /// All configured conversion/info tools as (name, program) pairs.
    pub fn all(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("gif_info", &self.gif_info),
            ("gif_fix", &self.gif_fix),
            ("gif_deanim", &self.gif_deanim),
            ("gif_interlace", &self.gif_interlace),
            ("gif_to_pnm", &self.gif_to_pnm),
            ("jpeg_to_pnm", &self.jpeg_to_pnm),
            ("png_to_pnm", &self.png_to_pnm),
            ("bmp_to_pnm", &self.bmp_to_pnm),
            ("tiff_to_pnm", &self.tiff_to_pnm),
            ("pdf_info", &self.pdf_info),
            ("pdf_to_ps", &self.pdf_to_ps),
            ("ps_to_raster", &self.ps_to_raster),
        ]
    }
}

/// Internal penalty deltas for protocol violations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyConfig {
    pub wrong_content_type: f32,
    pub wrong_extension: f32,
    pub corrupt_fixable: f32,
    pub corrupt_unfixable: f32,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            wrong_content_type: 1.5,
            wrong_extension: 1.0,
            corrupt_fixable: 2.5,
            corrupt_unfixable: 5.0,
        }
    }
}

/// Hash-cache backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HashingConfig {
    pub mode: HashingMode,
    /// Directory for the flat-file partitions; default data dir when unset.
    pub dir: Option<String>,
    /// SQLite database path for the shared backend.
    pub db_path: Option<String>,
}

/// Wordlist file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WordlistConfig {
    /// Global wordlist file.
    pub path: Option<String>,
    /// Per-user wordlist; entries override the global list.
    pub personal_path: Option<String>,
    /// Threshold for entries that do not carry their own.
    pub default_threshold: f32,
}

impl Default for WordlistConfig {
    fn default() -> Self {
        Self {
            path: None,
            personal_path: None,
            default_threshold: 0.25,
        }
    }
}

/// One configured OCR engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSetConfig {
    pub label: String,
    /// Command template; `{input}` is replaced with the raster path.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_scansets() -> Vec<ScanSetConfig> {
    vec![
        ScanSetConfig {
            label: "ocrad".to_string(),
            command: "ocrad -s 2 {input}".to_string(),
            args: Vec::new(),
        },
        ScanSetConfig {
            label: "ocrad-invert".to_string(),
            command: "ocrad -s 2 -i {input}".to_string(),
            args: Vec::new(),
        },
        ScanSetConfig {
            label: "gocr".to_string(),
            command: "gocr {input}".to_string(),
            args: Vec::new(),
        },
    ]
}

/// Temp workspace behavior.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Parent directory for per-message workspaces; system temp when unset.
    pub base_dir: Option<String>,
    pub keep: KeepWorkspace,
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub scan: ScanConfig,
    pub formats: FormatConfig,
    pub tools: ToolsConfig,
    pub penalties: PenaltyConfig,
    pub hashing: HashingConfig,
    pub wordlist: WordlistConfig,
    #[serde(default = "default_scansets")]
    pub scansets: Vec<ScanSetConfig>,
    pub workspace: WorkspaceConfig,
}

impl Settings {
    /// Load settings from a TOML file, or defaults when no file is given
    /// and the default location does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = Self::default_config_path();
                if !default.exists() {
                    let mut settings = Self::default();
                    settings.ensure_scansets();
                    return Ok(settings);
                }
                default
            }
        };
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let mut settings: Settings = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))?;
        settings.ensure_scansets();
        Ok(settings)
    }

    fn ensure_scansets(&mut self) {
        if self.scansets.is_empty() {
            self.scansets = default_scansets();
        }
    }

    /// Default config file location under the user config dir.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ocrsieve")
            .join("ocrsieve.toml")
    }

    /// Data directory for durable state (hash cache, scanset counters).
    pub fn data_dir(&self) -> PathBuf {
        self.hashing
            .dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("ocrsieve")
            })
    }

    /// Where scanset hit counters persist between runs.
    pub fn scanset_state_path(&self) -> PathBuf {
        self.data_dir().join("scansets.json")
    }

    pub fn wordlist_path(&self) -> Option<PathBuf> {
        self.wordlist.path.as_deref().map(expand_path)
    }

    pub fn personal_wordlist_path(&self) -> Option<PathBuf> {
        self.wordlist.personal_path.as_deref().map(expand_path)
    }

    pub fn workspace_base(&self) -> Option<PathBuf> {
        self.workspace.base_dir.as_deref().map(expand_path)
    }

    pub fn hash_db_path(&self) -> PathBuf {
        self.hashing
            .db_path
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(|| self.data_dir().join("ocrsieve.db"))
    }
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}
