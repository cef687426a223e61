//! Per-format conversion chains.
//!
//! Every chain is a fixed sequence of external tool invocations ending in
//! a PNM raster inside the message workspace. GIF gets a repair /
//! deanimation / interlace-fix sub-chain before conversion; PDF is gated
//! on page count and goes through an intermediate PostScript form.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{FormatConfig, ToolsConfig};
use crate::sniff::ImageFormat;
use crate::tool::{Sink, ToolIo, ToolResult, ToolRunner, RET_EXEC, RET_TIMEOUT};
use crate::workspace::TempWorkspace;

/// PDF pages are rasterized to at most this many pixels across.
pub const PDF_RASTER_WIDTH: u32 = 1000;
pub const PDF_RASTER_HEIGHT: u32 = 1414;

/// Per-frame marker in the GIF info tool's output.
const GIF_FRAME_MARKER: &str = "Image #";

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("tool {tool} could not be started")]
    Missing { tool: String },

    #[error("tool {tool} timed out")]
    Timeout { tool: String },

    #[error("tool {tool} failed with exit code {retcode}: {detail}")]
    Failed {
        tool: String,
        retcode: i32,
        detail: String,
    },

    #[error("source is corrupt beyond repair")]
    CorruptUnfixable,

    #[error("pdf has {pages} pages, over the configured maximum")]
    TooManyPages { pages: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A finished chain: where the raster landed and whether the repair step
/// had to paper over corruption.
pub struct ChainOutput {
    pub raster: PathBuf,
    pub fixable_corruption: bool,
}

fn check(tool: &str, result: ToolResult) -> Result<ToolResult, ChainError> {
    match result.retcode {
        0 => Ok(result),
        RET_TIMEOUT => Err(ChainError::Timeout { tool: tool.into() }),
        RET_EXEC => Err(ChainError::Missing { tool: tool.into() }),
        retcode => Err(ChainError::Failed {
            tool: tool.into(),
            retcode,
            detail: result.lines.join(" | "),
        }),
    }
}

fn path_arg(path: &Path) -> Vec<String> {
    vec![path.to_string_lossy().into_owned()]
}

/// Run the format's chain on `input`, producing a normalized raster named
/// after `prefix` inside the workspace.
pub(crate) async fn convert(
    format: ImageFormat,
    input: &Path,
    prefix: &str,
    ws: &TempWorkspace,
    runner: &ToolRunner,
    tools: &ToolsConfig,
    formats: &FormatConfig,
) -> Result<ChainOutput, ChainError> {
    match format {
        ImageFormat::Gif => gif_chain(input, prefix, ws, runner, tools).await,
        ImageFormat::Jpeg => simple_chain(&tools.jpeg_to_pnm, input, prefix, ws, runner).await,
        ImageFormat::Png => simple_chain(&tools.png_to_pnm, input, prefix, ws, runner).await,
        ImageFormat::Bmp => simple_chain(&tools.bmp_to_pnm, input, prefix, ws, runner).await,
        ImageFormat::Tiff => simple_chain(&tools.tiff_to_pnm, input, prefix, ws, runner).await,
        ImageFormat::Pdf => pdf_chain(input, prefix, ws, runner, tools, formats).await,
    }
}

/// One converter reading the input path and writing PNM to stdout.
async fn simple_chain(
    tool: &str,
    input: &Path,
    prefix: &str,
    ws: &TempWorkspace,
    runner: &ToolRunner,
) -> Result<ChainOutput, ChainError> {
    let raster = ws.file(&format!("{prefix}.pnm"));
    check(
        tool,
        runner
            .invoke(tool, &path_arg(input), ToolIo::stdout_to(&raster))
            .await,
    )?;
    Ok(ChainOutput {
        raster,
        fixable_corruption: false,
    })
}

async fn gif_chain(
    input: &Path,
    prefix: &str,
    ws: &TempWorkspace,
    runner: &ToolRunner,
    tools: &ToolsConfig,
) -> Result<ChainOutput, ChainError> {
    let info = check(
        &tools.gif_info,
        runner
            .invoke(&tools.gif_info, &path_arg(input), ToolIo::capture())
            .await,
    )?;
    let frames = info
        .lines
        .iter()
        .filter(|l| l.contains(GIF_FRAME_MARKER))
        .count();
    let interlaced = info
        .lines
        .iter()
        .any(|l| l.to_lowercase().contains("interlaced"));
    tracing::debug!(frames, interlaced, "gif info");

    let mut working = input.to_path_buf();
    let mut fixable_corruption = false;

    if frames <= 1 && !interlaced {
        let fixed = ws.file(&format!("{prefix}-fixed.gif"));
        let io = ToolIo {
            stdin: None,
            stdout: Sink::File(&fixed),
            stderr: Sink::Capture,
        };
        let result = runner.invoke(&tools.gif_fix, &path_arg(&working), io).await;
        match result.retcode {
            RET_TIMEOUT => {
                return Err(ChainError::Timeout {
                    tool: tools.gif_fix.clone(),
                })
            }
            RET_EXEC => {
                return Err(ChainError::Missing {
                    tool: tools.gif_fix.clone(),
                })
            }
            _ => {}
        }

        let corrupt = result
            .lines
            .iter()
            .any(|l| l.contains(&tools.gif_corruption_marker));
        if corrupt {
            let fixed_len = std::fs::metadata(&fixed).map(|m| m.len()).unwrap_or(0);
            if fixed_len == 0 {
                return Err(ChainError::CorruptUnfixable);
            }
            tracing::info!("gif repaired after corruption");
            fixable_corruption = true;
            working = fixed;
        } else if result.ok() {
            working = fixed;
        } else {
            return Err(ChainError::Failed {
                tool: tools.gif_fix.clone(),
                retcode: result.retcode,
                detail: result.lines.join(" | "),
            });
        }
    }

    if frames > 1 {
        let single = ws.file(&format!("{prefix}-frame.gif"));
        check(
            &tools.gif_deanim,
            runner
                .invoke(
                    &tools.gif_deanim,
                    &path_arg(&working),
                    ToolIo::stdout_to(&single),
                )
                .await,
        )?;
        working = single;
    }

    if interlaced {
        let progressive = ws.file(&format!("{prefix}-progressive.gif"));
        check(
            &tools.gif_interlace,
            runner
                .invoke(
                    &tools.gif_interlace,
                    &path_arg(&working),
                    ToolIo::stdout_to(&progressive),
                )
                .await,
        )?;
        working = progressive;
    }

    let raster = ws.file(&format!("{prefix}.pnm"));
    check(
        &tools.gif_to_pnm,
        runner
            .invoke(
                &tools.gif_to_pnm,
                &path_arg(&working),
                ToolIo::stdout_to(&raster),
            )
            .await,
    )?;
    Ok(ChainOutput {
        raster,
        fixable_corruption,
    })
}

async fn pdf_chain(
    input: &Path,
    prefix: &str,
    ws: &TempWorkspace,
    runner: &ToolRunner,
    tools: &ToolsConfig,
    formats: &FormatConfig,
) -> Result<ChainOutput, ChainError> {
    let info = check(
        &tools.pdf_info,
        runner
            .invoke(&tools.pdf_info, &path_arg(input), ToolIo::capture())
            .await,
    )?;
    let pages = page_count(&info.lines).unwrap_or(1);
    if pages > formats.max_pdf_pages {
        return Err(ChainError::TooManyPages { pages });
    }

    let ps = ws.file(&format!("{prefix}.ps"));
    let mut to_ps_args = path_arg(input);
    to_ps_args.push(ps.to_string_lossy().into_owned());
    check(
        &tools.pdf_to_ps,
        runner
            .invoke(
                &tools.pdf_to_ps,
                &to_ps_args,
                ToolIo {
                    stdin: None,
                    stdout: Sink::Discard,
                    stderr: Sink::Discard,
                },
            )
            .await,
    )?;

    let raster = ws.file(&format!("{prefix}.ppm"));
    let gs_args = vec![
        "-q".to_string(),
        "-dSAFER".to_string(),
        "-dBATCH".to_string(),
        "-dNOPAUSE".to_string(),
        "-sDEVICE=ppmraw".to_string(),
        "-dFirstPage=1".to_string(),
        "-dLastPage=1".to_string(),
        format!("-g{PDF_RASTER_WIDTH}x{PDF_RASTER_HEIGHT}"),
        format!("-sOutputFile={}", raster.display()),
        ps.to_string_lossy().into_owned(),
    ];
    check(
        &tools.ps_to_raster,
        runner
            .invoke(
                &tools.ps_to_raster,
                &gs_args,
                ToolIo {
                    stdin: None,
                    stdout: Sink::Discard,
                    stderr: Sink::Discard,
                },
            )
            .await,
    )?;

    Ok(ChainOutput {
        raster,
        fixable_corruption: false,
    })
}

/// Pull the page count out of the PDF info tool's output.
fn page_count(lines: &[String]) -> Option<u32> {
    for line in lines {
        if line.starts_with("Pages:") {
            return line.split_whitespace().nth(1).and_then(|s| s.parse().ok());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_parses_info_output() {
        let lines: Vec<String> = [
            "Title:          quarterly report",
            "Pages:          12",
            "Encrypted:      no",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(page_count(&lines), Some(12));
        assert_eq!(page_count(&[]), None);
    }

    #[test]
    fn check_maps_retcode_sentinels() {
        let ok = ToolResult {
            retcode: 0,
            lines: vec![],
        };
        assert!(check("t", ok).is_ok());

        let timeout = ToolResult {
            retcode: RET_TIMEOUT,
            lines: vec![],
        };
        assert!(matches!(
            check("t", timeout),
            Err(ChainError::Timeout { .. })
        ));

        let missing = ToolResult {
            retcode: RET_EXEC,
            lines: vec![],
        };
        assert!(matches!(
            check("t", missing),
            Err(ChainError::Missing { .. })
        ));

        let failed = ToolResult {
            retcode: 2,
            lines: vec!["bad file".to_string()],
        };
        assert!(matches!(
            check("t", failed),
            Err(ChainError::Failed { retcode: 2, .. })
        ));
    }
}
