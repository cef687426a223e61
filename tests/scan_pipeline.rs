//! End-to-end pipeline tests against fake external tools.
//!
//! The conversion and OCR binaries are stand-in shell scripts, so these
//! tests exercise the real orchestration: gating, the GIF chain, cache
//! lookups and learning writes, scoring, and the global timeout.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use tempfile::TempDir;

use ocrsieve::config::{HashingMode, KeepWorkspace, ScanSetConfig, Settings};
use ocrsieve::hashdb::{digest_raster, FlatFileStore, HashMeta, HashStore, Partition};
use ocrsieve::host::{HostApi, StandaloneHost};
use ocrsieve::pipeline::{ImageOutcome, Scanner};

/// Write an executable shell script into `dir` and return its path.
fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn gif_bytes(width: u16, height: u16) -> Vec<u8> {
    let mut data = b"GIF89a".to_vec();
    data.extend_from_slice(&width.to_le_bytes());
    data.extend_from_slice(&height.to_le_bytes());
    data.extend_from_slice(&[0u8; 32]);
    data
}

fn build_eml(attachments: &[(&str, &str, &[u8])]) -> Vec<u8> {
    let mut msg = String::from(
        "From: sender@example.com\r\n\
         To: victim@example.com\r\n\
         Subject: special offer\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"SIEVE\"\r\n\
         \r\n\
         --SIEVE\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         see attached\r\n",
    );
    for (content_type, name, data) in attachments {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        msg.push_str(&format!(
            "--SIEVE\r\n\
             Content-Type: {content_type}; name=\"{name}\"\r\n\
             Content-Disposition: attachment; filename=\"{name}\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {encoded}\r\n"
        ));
    }
    msg.push_str("--SIEVE--\r\n");
    msg.into_bytes()
}

/// Test fixture: tool scripts, data dir, wordlist, and settings wired to
/// the fakes.
struct Fixture {
    dir: TempDir,
    settings: Settings,
}

impl Fixture {
    /// A working single-frame GIF chain plus an OCR engine that always
    /// prints `ocr_output`.
    fn new(ocr_output: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tools = dir.path();

        let gif_info = fake_tool(tools, "giftext", "echo 'Image #1:'");
        let gif_fix = fake_tool(tools, "giffix", "cat \"$1\"");
        let gif_to_pnm = fake_tool(tools, "giftopnm", "cat \"$1\"");
        let ocr = fake_tool(tools, "fakeocr", &format!("echo \"{ocr_output}\""));

        let wordlist = tools.join("words.txt");
        std::fs::write(&wordlist, "viagra:0.2\ncialis:0.2\n").unwrap();

        let data_dir = tools.join("data");

        let mut settings = Settings::default();
        settings.scan.required_count = 1;
        settings.scan.base_score = 3.0;
        settings.scan.add_score = 1.0;
        settings.tools.timeout_secs = 10;
        settings.tools.global_timeout_secs = 60;
        settings.tools.gif_info = gif_info.display().to_string();
        settings.tools.gif_fix = gif_fix.display().to_string();
        settings.tools.gif_to_pnm = gif_to_pnm.display().to_string();
        settings.wordlist.path = Some(wordlist.display().to_string());
        settings.hashing.dir = Some(data_dir.display().to_string());
        settings.scansets = vec![ScanSetConfig {
            label: "fake".to_string(),
            command: format!("{} {{input}}", ocr.display()),
            args: Vec::new(),
        }];
        Self { dir, settings }
    }

    fn tools_dir(&self) -> &Path {
        self.dir.path()
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }
}

async fn scan(settings: Settings, raw: &[u8]) -> (ocrsieve::ScanReport, StandaloneHost) {
    let mut host = StandaloneHost::new(raw.to_vec());
    let mut scanner = Scanner::new(settings);
    let report = scanner.scan(raw, &mut host).await;
    (report, host)
}

#[tokio::test]
async fn gif_with_rendered_spam_word_scores_base() {
    let fixture = Fixture::new("buy viagra now");
    let raw = build_eml(&[("image/gif", "offer.gif", &gif_bytes(640, 480))]);

    let (report, host) = scan(fixture.settings.clone(), &raw).await;

    assert_eq!(report.score, 3.0);
    assert!(report.description.contains("viagra"));
    assert_eq!(report.images.len(), 1);
    assert!(matches!(
        report.images[0].outcome,
        ImageOutcome::Scanned { matches: 1, .. }
    ));
    let rule = host.reports.iter().find(|r| r.rule == "OCRSIEVE").unwrap();
    assert_eq!(rule.score, 3.0);
}

#[tokio::test]
async fn clean_image_scores_zero() {
    let fixture = Fixture::new("quarterly results attached");
    let raw = build_eml(&[("image/gif", "chart.gif", &gif_bytes(640, 480))]);

    let (report, host) = scan(fixture.settings.clone(), &raw).await;

    assert_eq!(report.score, 0.0);
    assert!(host.reports.is_empty());
}

#[tokio::test]
async fn undersized_attachment_runs_no_subprocess() {
    let mut fixture = Fixture::new("viagra");
    let marker = fixture.tools_dir().join("ran.marker");
    // every tool would leave a marker if it ran
    let tracer = fake_tool(
        fixture.tools_dir(),
        "tracer",
        &format!("echo ran >> {}", marker.display()),
    );
    let tracer = tracer.display().to_string();
    fixture.settings.tools.gif_info = tracer.clone();
    fixture.settings.tools.gif_fix = tracer.clone();
    fixture.settings.tools.gif_to_pnm = tracer.clone();
    fixture.settings.scansets[0].command = format!("{tracer} {{input}}");

    let raw = build_eml(&[("image/gif", "tiny.gif", &gif_bytes(10, 10))]);
    let (report, _) = scan(fixture.settings.clone(), &raw).await;

    assert_eq!(report.score, 0.0);
    assert!(matches!(
        report.images[0].outcome,
        ImageOutcome::Rejected { .. }
    ));
    assert!(!marker.exists(), "no external tool may run for a gated image");
}

#[tokio::test]
async fn known_spam_digest_skips_all_ocr() {
    let mut fixture = Fixture::new("viagra");
    fixture.settings.hashing.mode = HashingMode::Local;

    // the fake chain is `cat`, so the raster equals the attachment bytes
    let image = gif_bytes(640, 480);
    let digest = digest_raster(&image);
    let mut store = FlatFileStore::open(&fixture.data_dir()).unwrap();
    store
        .put(
            &digest,
            5.0,
            Partition::KnownSpam,
            &HashMeta::default(),
            "seen before",
        )
        .unwrap();

    // an OCR engine that would prove it ran
    let marker = fixture.tools_dir().join("ocr.marker");
    let ocr = fake_tool(
        fixture.tools_dir(),
        "markerocr",
        &format!("echo ran >> {}; echo viagra", marker.display()),
    );
    fixture.settings.scansets[0].command = format!("{} {{input}}", ocr.display());

    let raw = build_eml(&[
        ("image/gif", "seen.gif", &image),
        ("image/gif", "later.gif", &gif_bytes(641, 480)),
    ]);
    let (report, host) = scan(fixture.settings.clone(), &raw).await;

    assert_eq!(report.score, 5.0);
    assert_eq!(report.description, "seen before");
    assert!(matches!(
        report.images[0].outcome,
        ImageOutcome::KnownSpam { .. }
    ));
    // the second image was never reached
    assert_eq!(report.images.len(), 1);
    assert!(!marker.exists(), "no scanset may run on a known-spam hit");
    assert_eq!(host.reports[0].score, 5.0);
}

#[tokio::test]
async fn ham_learning_is_idempotent_on_replay() {
    let mut fixture = Fixture::new("nothing of note");
    fixture.settings.hashing.mode = HashingMode::LocalLearnHam;
    let raw = build_eml(&[("image/gif", "cat.gif", &gif_bytes(640, 480))]);

    let (first, _) = scan(fixture.settings.clone(), &raw).await;
    assert_eq!(first.score, 0.0);
    assert!(matches!(
        first.images[0].outcome,
        ImageOutcome::Scanned { matches: 0, .. }
    ));

    let good_file = fixture.data_dir().join("known-good.jsonl");
    let after_first = std::fs::read_to_string(&good_file).unwrap();
    assert_eq!(after_first.lines().count(), 1);

    // replay: the digest is now known good, OCR is skipped, nothing new
    // is written
    let (second, _) = scan(fixture.settings.clone(), &raw).await;
    assert_eq!(second.score, 0.0);
    assert!(matches!(
        second.images[0].outcome,
        ImageOutcome::KnownGood
    ));
    let after_second = std::fs::read_to_string(&good_file).unwrap();
    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn spam_verdict_learns_digest_for_next_scan() {
    let mut fixture = Fixture::new("viagra viagra");
    fixture.settings.hashing.mode = HashingMode::Local;
    let raw = build_eml(&[("image/gif", "offer.gif", &gif_bytes(640, 480))]);

    let (first, _) = scan(fixture.settings.clone(), &raw).await;
    assert_eq!(first.score, 3.0);

    let (second, _) = scan(fixture.settings.clone(), &raw).await;
    assert_eq!(second.score, 3.0);
    assert!(matches!(
        second.images[0].outcome,
        ImageOutcome::KnownSpam { .. }
    ));
}

#[tokio::test]
async fn mismatched_declarations_are_penalized() {
    let fixture = Fixture::new("nothing here");
    let raw = build_eml(&[("image/jpeg", "photo.jpg", &gif_bytes(640, 480))]);

    let (report, host) = scan(fixture.settings.clone(), &raw).await;

    assert_eq!(report.score, 0.0);
    let rules: Vec<&str> = host.reports.iter().map(|r| r.rule.as_str()).collect();
    assert!(rules.contains(&"OCRSIEVE_WRONG_CTYPE"));
    assert!(rules.contains(&"OCRSIEVE_WRONG_EXT"));
    assert_eq!(host.current_score(), 2.5);
}

#[tokio::test]
async fn octet_stream_declaration_is_not_penalized() {
    let fixture = Fixture::new("nothing here");
    let raw = build_eml(&[(
        "application/octet-stream",
        "offer.gif",
        &gif_bytes(640, 480),
    )]);

    let (_, host) = scan(fixture.settings.clone(), &raw).await;
    assert!(host.reports.is_empty());
}

#[tokio::test]
async fn animated_gif_is_deanimated_before_conversion() {
    let mut fixture = Fixture::new("viagra");
    let gif_info = fake_tool(
        fixture.tools_dir(),
        "giftext-animated",
        "echo 'Image #1:'; echo 'Image #2:'",
    );
    let marker = fixture.tools_dir().join("deanim.marker");
    let deanim = fake_tool(
        fixture.tools_dir(),
        "gifasm",
        &format!("echo ran >> {}; cat \"$1\"", marker.display()),
    );
    fixture.settings.tools.gif_info = gif_info.display().to_string();
    fixture.settings.tools.gif_deanim = deanim.display().to_string();

    let raw = build_eml(&[("image/gif", "anim.gif", &gif_bytes(640, 480))]);
    let (report, _) = scan(fixture.settings.clone(), &raw).await;

    assert!(marker.exists(), "deanimation tool must run for multi-frame gifs");
    assert_eq!(report.score, 3.0);
}

#[tokio::test]
async fn fixable_corruption_continues_with_penalty() {
    let mut fixture = Fixture::new("viagra");
    let gif_fix = fake_tool(
        fixture.tools_dir(),
        "giffix-corrupt",
        "echo 'GIF-LIB error: fixed it' >&2; cat \"$1\"",
    );
    fixture.settings.tools.gif_fix = gif_fix.display().to_string();

    let raw = build_eml(&[("image/gif", "broken.gif", &gif_bytes(640, 480))]);
    let (report, host) = scan(fixture.settings.clone(), &raw).await;

    // repaired image still gets scanned
    assert_eq!(report.score, 3.0);
    assert!(host
        .reports
        .iter()
        .any(|r| r.rule == "OCRSIEVE_CORRUPT_IMG" && r.score == 2.5));
}

#[tokio::test]
async fn unfixable_corruption_aborts_the_image() {
    let mut fixture = Fixture::new("viagra");
    let gif_fix = fake_tool(
        fixture.tools_dir(),
        "giffix-dead",
        "echo 'GIF-LIB error: hopeless' >&2",
    );
    fixture.settings.tools.gif_fix = gif_fix.display().to_string();

    let raw = build_eml(&[("image/gif", "dead.gif", &gif_bytes(640, 480))]);
    let (report, host) = scan(fixture.settings.clone(), &raw).await;

    assert_eq!(report.score, 0.0);
    assert!(matches!(
        report.images[0].outcome,
        ImageOutcome::Aborted { .. }
    ));
    assert!(host
        .reports
        .iter()
        .any(|r| r.rule == "OCRSIEVE_CORRUPT_UNFIXABLE" && r.score == 5.0));
}

#[tokio::test]
async fn missing_conversion_tool_drops_only_that_image() {
    let mut fixture = Fixture::new("viagra");
    fixture.settings.tools.gif_to_pnm = "/nonexistent/giftopnm".to_string();

    let raw = build_eml(&[("image/gif", "offer.gif", &gif_bytes(640, 480))]);
    let (report, _) = scan(fixture.settings.clone(), &raw).await;

    assert_eq!(report.score, 0.0);
    assert!(matches!(
        report.images[0].outcome,
        ImageOutcome::Aborted { .. }
    ));
}

#[tokio::test]
async fn pdf_chain_respects_page_gate() {
    let mut fixture = Fixture::new("viagra");
    let tools = fixture.tools_dir().to_path_buf();
    let pdf_info = fake_tool(&tools, "pdfinfo", "echo 'Pages:          2'");
    let pdf_to_ps = fake_tool(&tools, "pdftops", "cp \"$1\" \"$2\"");
    let gs = fake_tool(
        &tools,
        "gs",
        "out=; for a in \"$@\"; do case \"$a\" in -sOutputFile=*) out=\"${a#-sOutputFile=}\";; esac; done; echo raster > \"$out\"",
    );
    fixture.settings.tools.pdf_info = pdf_info.display().to_string();
    fixture.settings.tools.pdf_to_ps = pdf_to_ps.display().to_string();
    fixture.settings.tools.ps_to_raster = gs.display().to_string();

    let raw = build_eml(&[("application/pdf", "doc.pdf", b"%PDF-1.4 fake body")]);
    let (report, _) = scan(fixture.settings.clone(), &raw).await;
    assert_eq!(report.score, 3.0);

    // same chain, but over the page limit
    let many_pages = fake_tool(&tools, "pdfinfo-large", "echo 'Pages:          500'");
    fixture.settings.tools.pdf_info = many_pages.display().to_string();
    let (rejected, _) = scan(fixture.settings.clone(), &raw).await;
    assert_eq!(rejected.score, 0.0);
    assert!(matches!(
        rejected.images[0].outcome,
        ImageOutcome::Aborted { .. }
    ));
}

#[tokio::test]
async fn global_timeout_yields_neutral_score_and_no_workspace() {
    let mut fixture = Fixture::new("viagra");
    let stall = fake_tool(fixture.tools_dir(), "giftext-stall", "sleep 600");
    fixture.settings.tools.gif_info = stall.display().to_string();
    fixture.settings.tools.timeout_secs = 600;
    fixture.settings.tools.global_timeout_secs = 1;
    fixture.settings.workspace.keep = KeepWorkspace::Always;
    let workspaces = fixture.tools_dir().join("workspaces");
    fixture.settings.workspace.base_dir = Some(workspaces.display().to_string());

    let raw = build_eml(&[("image/gif", "slow.gif", &gif_bytes(640, 480))]);
    let start = std::time::Instant::now();
    let (report, host) = scan(fixture.settings.clone(), &raw).await;

    assert!(report.global_timeout);
    assert_eq!(report.score, 0.0);
    assert!(host.reports.is_empty());
    assert!(report.kept_workspace.is_none());
    assert!(start.elapsed() < std::time::Duration::from_secs(30));
    // the workspace was discarded despite keep=always
    let leftover = std::fs::read_dir(&workspaces)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn autodisabled_message_is_not_scanned() {
    let mut fixture = Fixture::new("viagra");
    let marker = fixture.tools_dir().join("ran.marker");
    let tracer = fake_tool(
        fixture.tools_dir(),
        "tracer",
        &format!("echo ran >> {}", marker.display()),
    );
    fixture.settings.tools.gif_info = tracer.display().to_string();
    fixture.settings.scan.autodisable_score = 10.0;

    let raw = build_eml(&[("image/gif", "offer.gif", &gif_bytes(640, 480))]);
    let mut host = StandaloneHost::with_score(raw.clone(), 50.0);
    let mut scanner = Scanner::new(fixture.settings.clone());
    let report = scanner.scan(&raw, &mut host).await;

    assert_eq!(report.score, 0.0);
    assert!(report.images.is_empty());
    assert!(!marker.exists());
}
