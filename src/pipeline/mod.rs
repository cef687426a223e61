//! Per-message scan pipeline.
//!
//! Orchestrates the whole run for one message: attachment gating,
//! workspace setup, format conversion chains, hash-cache lookups, scanset
//! iteration with fuzzy matching, score aggregation, and the learning
//! cache writes. The entire run sits under the global timeout; when it
//! fires the in-flight child process dies with the dropped future, the
//! workspace is discarded, and the message scores zero.

mod chains;

pub use chains::{ChainError, PDF_RASTER_WIDTH};

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::config::{KeepWorkspace, Settings};
use crate::email::{self, AttachmentPart};
use crate::hashdb::{self, HashMeta, HashStore, Partition};
use crate::host::HostApi;
use crate::matcher::{self, MatchOutcome, MatchPass, MatcherOptions};
use crate::scanset::ScansetRegistry;
use crate::score::{PenaltyKind, ScoreAccumulator};
use crate::sniff::{self, ImageFormat, Sniffed};
use crate::tool::{run_with_deadline, ToolRunner};
use crate::wordlist::Wordlist;
use crate::workspace::TempWorkspace;

/// One attachment that passed the gate, owned until the run finishes.
#[derive(Debug)]
pub struct CandidateImage {
    pub data: Vec<u8>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub size: u64,
    pub content_type: String,
    pub filename: String,
    pub path: Option<PathBuf>,
}

impl CandidateImage {
    fn from_part(part: AttachmentPart, sniffed: &Sniffed) -> Self {
        let size = part.data.len() as u64;
        Self {
            data: part.data,
            format: sniffed.format,
            width: sniffed.width,
            height: sniffed.height,
            size,
            content_type: part.content_type,
            filename: part.filename,
            path: None,
        }
    }

    fn meta(&self) -> HashMeta {
        HashMeta {
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            format: self.format.to_string(),
        }
    }
}

/// What happened to one attachment.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ImageOutcome {
    /// Dropped at the gate, no tool was run.
    Rejected { reason: String },
    /// Digest found in the known-spam partition.
    KnownSpam { score: f32 },
    /// Digest found in the known-good partition, OCR skipped.
    KnownGood,
    /// OCR ran; best scanset result recorded.
    Scanned {
        matches: u32,
        weighted: f32,
        scanset: Option<String>,
        despaced: bool,
    },
    /// The image chain aborted partway.
    Aborted { reason: String },
}

/// Per-attachment entry in the scan report.
#[derive(Debug, Clone, Serialize)]
pub struct ImageReport {
    pub filename: String,
    pub content_type: String,
    pub format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub digest: Option<String>,
    pub outcome: ImageOutcome,
}

/// Result of scanning one message.
#[derive(Debug, Serialize)]
pub struct ScanReport {
    pub score: f32,
    pub description: String,
    pub global_timeout: bool,
    pub images: Vec<ImageReport>,
    pub kept_workspace: Option<PathBuf>,
}

impl ScanReport {
    fn neutral() -> Self {
        Self {
            score: 0.0,
            description: String::new(),
            global_timeout: false,
            images: Vec::new(),
            kept_workspace: None,
        }
    }
}

/// Bookkeeping for an image that was actually OCR-scanned, used for the
/// post-run cache writes.
struct ScannedImage {
    digest: String,
    matches: u32,
    meta: HashMeta,
}

struct InnerOutcome {
    score: f32,
    description: String,
    images: Vec<ImageReport>,
}

/// The per-message scan pipeline.
pub struct Scanner {
    settings: Settings,
    registry: ScansetRegistry,
    store: Option<Box<dyn HashStore>>,
    runner: ToolRunner,
}

impl Scanner {
    pub fn new(settings: Settings) -> Self {
        let state_path = settings
            .scan
            .autosort
            .then(|| settings.scanset_state_path());
        let registry = ScansetRegistry::from_config(
            &settings.scansets,
            settings.scan.autosort_buffer,
            state_path,
        );
        let store = match hashdb::open_store(&settings) {
            Ok(store) => store,
            Err(e) => {
                tracing::error!("hash store unavailable, continuing without cache: {e}");
                None
            }
        };
        let runner = ToolRunner::new(Duration::from_secs(settings.tools.timeout_secs));
        Self {
            settings,
            registry,
            store,
            runner,
        }
    }

    /// Swap in a store, for hosts that manage the backend themselves.
    pub fn with_store(mut self, store: Box<dyn HashStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &ScansetRegistry {
        &self.registry
    }

    /// Scan one raw message and report the resulting score to the host.
    pub async fn scan(&mut self, raw_message: &[u8], host: &mut dyn HostApi) -> ScanReport {
        let pre_score = host.current_score();
        if pre_score > self.settings.scan.autodisable_score
            || pre_score < self.settings.scan.autodisable_negative_score
        {
            tracing::info!(score = pre_score, "pipeline autodisabled by message score");
            return ScanReport::neutral();
        }

        let parts = match email::candidate_parts(raw_message) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("cannot read message: {e}");
                return ScanReport::neutral();
            }
        };

        let mut reports = Vec::new();
        let mut candidates = Vec::new();
        for part in parts {
            match self.gate(&part) {
                Ok(sniffed) => candidates.push(CandidateImage::from_part(part, &sniffed)),
                Err(reason) => {
                    tracing::info!(filename = %part.filename, reason = %reason, "attachment rejected");
                    reports.push(ImageReport {
                        filename: part.filename,
                        content_type: part.content_type,
                        format: None,
                        width: 0,
                        height: 0,
                        digest: None,
                        outcome: ImageOutcome::Rejected { reason },
                    });
                }
            }
        }

        if candidates.is_empty() {
            return ScanReport {
                images: reports,
                ..ScanReport::neutral()
            };
        }

        let wordlist = self.load_wordlist();

        let base = self.settings.workspace_base();
        let mut ws = match TempWorkspace::create(base.as_deref(), self.settings.workspace.keep) {
            Ok(ws) => ws,
            Err(e) => {
                tracing::error!("cannot create workspace: {e}");
                return ScanReport {
                    images: reports,
                    ..ScanReport::neutral()
                };
            }
        };

        let limit = Duration::from_secs(self.settings.tools.global_timeout_secs);
        let inner = self.scan_inner(&mut ws, candidates, &wordlist, pre_score, host, reports);
        let outcome = run_with_deadline(limit, inner).await;
        match outcome {
            Some(outcome) => {
                if let Err(e) = self.registry.save() {
                    tracing::warn!("failed to persist scanset counters: {e}");
                }
                let kept_workspace = ws.finish();
                ScanReport {
                    score: outcome.score,
                    description: outcome.description,
                    global_timeout: false,
                    images: outcome.images,
                    kept_workspace,
                }
            }
            None => {
                tracing::error!("global timeout exceeded, abandoning message");
                ws.discard();
                ScanReport {
                    global_timeout: true,
                    ..ScanReport::neutral()
                }
            }
        }
    }

    /// Gate one attachment: recognized format, enabled, within bounds.
    fn gate(&self, part: &AttachmentPart) -> Result<Sniffed, String> {
        let sniffed =
            sniff::sniff(&part.data).map_err(|e| format!("unrecognized format: {e}"))?;
        if !self.settings.formats.is_enabled(sniffed.format) {
            return Err(format!("format {} disabled", sniffed.format));
        }
        // PDFs are gated later, by page count
        if sniffed.format != ImageFormat::Pdf {
            let bounds = &self.settings.formats;
            if sniffed.width < bounds.min_width
                || sniffed.width > bounds.max_width
                || sniffed.height < bounds.min_height
                || sniffed.height > bounds.max_height
            {
                return Err(format!(
                    "dimensions {}x{} outside configured bounds",
                    sniffed.width, sniffed.height
                ));
            }
        }
        Ok(sniffed)
    }

    fn load_wordlist(&self) -> Wordlist {
        let Some(path) = self.settings.wordlist_path() else {
            tracing::warn!("no wordlist configured, matching will find nothing");
            return Wordlist::default();
        };
        let personal = self.settings.personal_wordlist_path();
        match Wordlist::load(
            &path,
            personal.as_deref(),
            self.settings.wordlist.default_threshold,
        ) {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("{e}");
                Wordlist::default()
            }
        }
    }

    fn penalty(
        &self,
        kind: PenaltyKind,
        detail: &str,
        acc: &mut ScoreAccumulator,
        host: &mut dyn HostApi,
    ) {
        let delta = acc.add_penalty(kind, &self.settings.penalties);
        let rule = format!("{}_{}", self.settings.scan.rule_name, kind.rule_suffix());
        tracing::info!(rule = %rule, delta, detail, "penalty");
        host.report(&rule, delta, detail);
    }

    /// Content-type and extension mismatch penalties for one candidate.
    fn check_declared(
        &self,
        cand: &CandidateImage,
        acc: &mut ScoreAccumulator,
        host: &mut dyn HostApi,
    ) {
        let declared = cand
            .content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_lowercase();
        if declared != "application/octet-stream"
            && !cand.format.content_types().contains(&declared.as_str())
        {
            self.penalty(
                PenaltyKind::WrongContentType,
                &format!("declared {declared}, sniffed {}", cand.format),
                acc,
                host,
            );
        }

        if let Some(ext) = std::path::Path::new(&cand.filename)
            .extension()
            .and_then(|e| e.to_str())
        {
            let ext = ext.to_lowercase();
            if !cand.format.extensions().contains(&ext.as_str()) {
                self.penalty(
                    PenaltyKind::WrongExtension,
                    &format!("extension .{ext} on a {} attachment", cand.format),
                    acc,
                    host,
                );
            }
        }
    }

    async fn scan_inner(
        &mut self,
        ws: &mut TempWorkspace,
        candidates: Vec<CandidateImage>,
        wordlist: &Wordlist,
        pre_score: f32,
        host: &mut dyn HostApi,
        mut reports: Vec<ImageReport>,
    ) -> InnerOutcome {
        let mut acc = ScoreAccumulator::default();
        let mut scanned: Vec<ScannedImage> = Vec::new();

        // When the workspace may outlive the run, capture the message
        // itself alongside the images for diagnosis.
        if !matches!(self.settings.workspace.keep, KeepWorkspace::Never) {
            if let Some(raw) = host.raw_message() {
                if let Err(e) = std::fs::write(ws.file("message.eml"), raw) {
                    tracing::debug!("could not capture message for diagnostics: {e}");
                }
            }
        }

        let opts = MatcherOptions {
            strip_numbers: self.settings.scan.strip_numbers,
            unique_match: self.settings.scan.unique_match,
            required_count: self.settings.scan.required_count,
        };

        for (index, mut cand) in candidates.into_iter().enumerate() {
            let prefix = format!("img-{index}");
            tracing::info!(
                filename = %cand.filename,
                format = %cand.format,
                width = cand.width,
                height = cand.height,
                bytes = cand.size,
                "scanning image"
            );
            let mut report = ImageReport {
                filename: cand.filename.clone(),
                content_type: cand.content_type.clone(),
                format: Some(cand.format.to_string()),
                width: cand.width,
                height: cand.height,
                digest: None,
                outcome: ImageOutcome::Aborted {
                    reason: "not scanned".to_string(),
                },
            };

            let input = ws.file(&format!(
                "{prefix}.{}",
                cand.format.extensions()[0]
            ));
            if let Err(e) = std::fs::write(&input, &cand.data) {
                tracing::error!("cannot write attachment to workspace: {e}");
                ws.note_error();
                report.outcome = ImageOutcome::Aborted {
                    reason: format!("workspace write failed: {e}"),
                };
                reports.push(report);
                continue;
            }
            cand.path = Some(input.clone());

            self.check_declared(&cand, &mut acc, host);

            // Penalties alone can push the message over the line; no
            // point paying for OCR then.
            if pre_score + acc.penalties > self.settings.scan.autodisable_score {
                tracing::info!("score threshold reached before scanning, stopping");
                report.outcome = ImageOutcome::Aborted {
                    reason: "score threshold reached before scan".to_string(),
                };
                reports.push(report);
                break;
            }

            let chain = chains::convert(
                cand.format,
                &input,
                &prefix,
                ws,
                &self.runner,
                &self.settings.tools,
                &self.settings.formats,
            )
            .await;

            let output = match chain {
                Ok(output) => output,
                Err(ChainError::CorruptUnfixable) => {
                    self.penalty(
                        PenaltyKind::CorruptUnfixable,
                        &format!("{} is corrupt beyond repair", cand.filename),
                        &mut acc,
                        host,
                    );
                    ws.note_error();
                    report.outcome = ImageOutcome::Aborted {
                        reason: "unfixable corruption".to_string(),
                    };
                    reports.push(report);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(filename = %cand.filename, "image chain aborted: {e}");
                    ws.note_error();
                    report.outcome = ImageOutcome::Aborted {
                        reason: e.to_string(),
                    };
                    reports.push(report);
                    continue;
                }
            };

            if output.fixable_corruption {
                self.penalty(
                    PenaltyKind::CorruptFixable,
                    &format!("{} was corrupt but repairable", cand.filename),
                    &mut acc,
                    host,
                );
            }

            let raster_bytes = match std::fs::read(&output.raster) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("cannot read converted raster: {e}");
                    ws.note_error();
                    report.outcome = ImageOutcome::Aborted {
                        reason: format!("raster read failed: {e}"),
                    };
                    reports.push(report);
                    continue;
                }
            };
            if raster_bytes.len() as u64 > self.settings.formats.max_raster_bytes {
                tracing::info!(
                    bytes = raster_bytes.len(),
                    "converted raster over size bound, dropping image"
                );
                report.outcome = ImageOutcome::Aborted {
                    reason: "converted raster over size bound".to_string(),
                };
                reports.push(report);
                continue;
            }

            let digest = hashdb::digest_raster(&raster_bytes);
            report.digest = Some(digest.clone());

            if let Some(store) = self.store.as_ref() {
                match store.get(&digest, Partition::KnownSpam) {
                    Ok(Some((score, description))) if score > 0.0 => {
                        tracing::info!(digest = %digest, score, "known-spam hit");
                        host.report(&self.settings.scan.rule_name, score, &description);
                        report.outcome = ImageOutcome::KnownSpam { score };
                        reports.push(report);
                        return InnerOutcome {
                            score,
                            description,
                            images: reports,
                        };
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("known-spam lookup failed, treating as miss: {e}"),
                }
                match store.get(&digest, Partition::KnownGood) {
                    Ok(Some(_)) => {
                        tracing::info!(digest = %digest, "known-good hit, skipping ocr");
                        report.outcome = ImageOutcome::KnownGood;
                        reports.push(report);
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("known-good lookup failed, treating as miss: {e}"),
                }
            }

            // Scanset iteration: best engine wins.
            let mut best: Option<(MatchOutcome, String)> = None;
            for set_index in self.registry.order() {
                let Some(set) = self.registry.get(set_index).cloned() else {
                    continue;
                };
                let result = self.registry.run(&set, &self.runner, &output.raster).await;
                if !result.ok() {
                    tracing::warn!(
                        scanset = %set.label,
                        retcode = result.retcode,
                        "scanset failed, aborting image chain: {}",
                        result.lines.join(" | ")
                    );
                    ws.note_error();
                    break;
                }

                let outcome = matcher::match_lines(&result.lines, wordlist, opts);
                tracing::debug!(
                    scanset = %set.label,
                    count = outcome.count,
                    "scanset matched"
                );
                let replace = match &best {
                    Some((current, _)) => outcome.count > current.count,
                    None => outcome.count > 0,
                };
                if replace {
                    best = Some((outcome.clone(), set.label.clone()));
                }

                if self.settings.scan.minimal_scanset
                    && outcome.count >= self.settings.scan.required_count
                {
                    if self.settings.scan.autosort {
                        self.registry.reward(&set.label);
                    }
                    break;
                }
            }

            let (matches, weighted, scanset, despaced) = match best {
                Some((outcome, label)) => {
                    let weighted = acc.add_image_matches(&outcome, &self.settings.scan);
                    (
                        outcome.count,
                        weighted,
                        Some(label),
                        outcome.pass == MatchPass::Despaced,
                    )
                }
                None => (0, 0.0, None, false),
            };

            scanned.push(ScannedImage {
                digest,
                matches,
                meta: cand.meta(),
            });
            report.outcome = ImageOutcome::Scanned {
                matches,
                weighted,
                scanset,
                despaced,
            };
            reports.push(report);
        }

        let score = crate::score::final_score(acc.occurrences, &self.settings.scan);
        let description = acc.describe();
        if score > 0.0 {
            host.report(&self.settings.scan.rule_name, score, &description);
        }

        self.write_cache_entries(score, &description, &scanned);

        InnerOutcome {
            score,
            description,
            images: reports,
        }
    }

    /// Learning writes after the run: spam entries for matched images on
    /// a positive score, ham entries for clean images on a zero score.
    fn write_cache_entries(&mut self, score: f32, description: &str, scanned: &[ScannedImage]) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        if score > 0.0 {
            for image in scanned.iter().filter(|i| i.matches > 0) {
                if let Err(e) = store.put(
                    &image.digest,
                    score,
                    Partition::KnownSpam,
                    &image.meta,
                    description,
                ) {
                    tracing::warn!("known-spam write failed: {e}");
                }
            }
        } else if self.settings.hashing.mode.learns_ham() {
            for image in scanned.iter().filter(|i| i.matches == 0) {
                if let Err(e) =
                    store.put(&image.digest, 0.0, Partition::KnownGood, &image.meta, "")
                {
                    tracing::warn!("known-good write failed: {e}");
                }
            }
        }
    }
}
