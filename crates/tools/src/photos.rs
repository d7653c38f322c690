//! Date-bucketed photo organizer.
//!
//! Photos are bucketed by modification time into `YYYY_MM` (or
//! `YYYY_MM_DD`) directories under the output directory. Name clashes get
//! `_1`, `_2`, ... suffixes. A dry run returns the move plan without
//! touching the filesystem.

use crate::traits::{access_failure, preflight, ArgsValidator, ErrorCode, SpecError, Tool, ToolResult, ToolSpec};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiergate_policy::{AccessValidator, Tier};
use tracing::{error, info, warn};

const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "tiff", "heic", "heif"];
const PLAN_PREVIEW_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BucketMode {
    Month,
    Day,
}

impl BucketMode {
    fn parse(mode: Option<&str>) -> Self {
        match mode {
            Some("yyyy_mm_dd") => BucketMode::Day,
            _ => BucketMode::Month,
        }
    }

    fn dir_name(&self, taken: &DateTime<Local>) -> String {
        match self {
            BucketMode::Month => taken.format("%Y_%m").to_string(),
            BucketMode::Day => taken.format("%Y_%m_%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PlannedMove {
    source: PathBuf,
    destination: PathBuf,
    date_taken: String,
}

#[derive(Debug, Clone, Serialize)]
struct FailedMove {
    source: PathBuf,
    error: String,
}

pub struct OrganizePhotosTool {
    spec: ToolSpec,
    validator: ArgsValidator,
    access: Arc<AccessValidator>,
}

impl OrganizePhotosTool {
    pub fn new(access: Arc<AccessValidator>) -> Result<Self, SpecError> {
        let spec = ToolSpec::new(
            "organize_photos",
            "Organize photos into directories by date taken",
            json!({
                "type": "object",
                "properties": {
                    "input_dir": {
                        "type": "string",
                        "description": "Source directory containing photos"
                    },
                    "output_dir": {
                        "type": "string",
                        "description": "Destination directory for organized photos"
                    },
                    "mode": {
                        "type": "string",
                        "enum": ["yyyy_mm", "yyyy_mm_dd"],
                        "description": "Organization mode: 'yyyy_mm' or 'yyyy_mm_dd'"
                    }
                },
                "required": ["input_dir", "output_dir"]
            }),
        )
        .with_tier(Tier::WriteSafe)
        .with_confirmation()
        .with_timeout_secs(120);
        let validator = ArgsValidator::compile(&spec)?;
        Ok(Self {
            spec,
            validator,
            access,
        })
    }
}

fn is_photo(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PHOTO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn scan_photos(dir: &Path, found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            scan_photos(&path, found)?;
        } else if file_type.is_file() && is_photo(&path) {
            found.push(path);
        }
    }
    Ok(())
}

fn date_taken(path: &Path) -> io::Result<DateTime<Local>> {
    Ok(DateTime::<Local>::from(fs::metadata(path)?.modified()?))
}

/// First free name in `dir` for `file_name`, skipping names already
/// claimed earlier in the same plan.
fn free_destination(dir: &Path, file_name: &Path, claimed: &HashSet<PathBuf>) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() && !claimed.contains(&candidate) {
        return candidate;
    }

    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut counter = 1;
    loop {
        let candidate = dir.join(format!("{stem}_{counter}{extension}"));
        if !candidate.exists() && !claimed.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

fn build_plan(input: &Path, output: &Path, mode: BucketMode) -> io::Result<Vec<PlannedMove>> {
    let mut photos = Vec::new();
    scan_photos(input, &mut photos)?;
    photos.sort();

    let mut claimed = HashSet::new();
    let mut plan = Vec::with_capacity(photos.len());
    for source in photos {
        let taken = date_taken(&source)?;
        let bucket = output.join(mode.dir_name(&taken));
        let Some(file_name) = source.file_name().map(PathBuf::from) else {
            continue;
        };
        if bucket.join(&file_name) == source {
            continue;
        }
        let destination = free_destination(&bucket, &file_name, &claimed);
        claimed.insert(destination.clone());
        plan.push(PlannedMove {
            source,
            destination,
            date_taken: taken.to_rfc3339(),
        });
    }
    Ok(plan)
}

fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Cross-device: copy then remove.
            fs::copy(source, destination)?;
            fs::remove_file(source)
        }
    }
}

fn apply_plan(plan: &[PlannedMove]) -> (usize, Vec<FailedMove>) {
    let mut moved = 0;
    let mut failed = Vec::new();
    for item in plan {
        // The destination may have appeared since planning.
        let destination = if item.destination.exists() {
            let dir = item.destination.parent().unwrap_or(Path::new("."));
            let name = item.destination.file_name().map(PathBuf::from).unwrap_or_default();
            free_destination(dir, &name, &HashSet::new())
        } else {
            item.destination.clone()
        };

        match move_file(&item.source, &destination) {
            Ok(()) => {
                info!("Moved {} -> {}", item.source.display(), destination.display());
                moved += 1;
            }
            Err(e) => {
                warn!("Failed to move {}: {}", item.source.display(), e);
                failed.push(FailedMove {
                    source: item.source.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
    (moved, failed)
}

#[async_trait]
impl Tool for OrganizePhotosTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        self.validator.validate(args)
    }

    async fn execute(&self, args: &Value, dry_run: bool) -> ToolResult {
        if let Some(rejected) = preflight(self, args, dry_run) {
            return rejected;
        }

        let input = match self.access.validate_read(args["input_dir"].as_str().unwrap_or_default()) {
            Ok(path) => path,
            Err(e) => return access_failure(&e),
        };
        let output = match self.access.validate_write(args["output_dir"].as_str().unwrap_or_default()) {
            Ok(path) => path,
            Err(e) => return access_failure(&e),
        };
        if !input.is_dir() {
            return ToolResult::failure(
                ErrorCode::InvalidArguments,
                format!("Input directory does not exist: {}", input.display()),
            );
        }

        let mode = BucketMode::parse(args["mode"].as_str());
        let work = tokio::task::spawn_blocking(move || -> io::Result<Value> {
            let plan = build_plan(&input, &output, mode)?;
            let total = plan.len();
            let preview: Vec<&PlannedMove> = plan.iter().take(PLAN_PREVIEW_LEN).collect();

            if dry_run {
                return Ok(json!({
                    "dry_run": true,
                    "total_photos": total,
                    "plan": preview,
                    "message": format!(
                        "Would move {} photos from {} into {}",
                        total,
                        input.display(),
                        output.display()
                    ),
                }));
            }

            let (moved, failed) = apply_plan(&plan);
            Ok(json!({
                "dry_run": false,
                "total_photos": total,
                "moved": moved,
                "failed": failed,
                "plan": preview,
                "message": format!("Moved {moved} of {total} photos"),
            }))
        })
        .await;

        match work {
            Ok(Ok(data)) => {
                let failures = data["failed"].as_array().map(Vec::len).unwrap_or(0);
                if failures > 0 {
                    let message = data["message"].as_str().unwrap_or_default().to_string();
                    return ToolResult::failure(
                        ErrorCode::NativeToolError,
                        format!("{message}; {failures} failed"),
                    )
                    .with_details(data);
                }
                ToolResult::success(data)
            }
            Ok(Err(e)) => {
                error!("organize_photos failed: {}", e);
                ToolResult::failure(
                    ErrorCode::NativeToolError,
                    format!("Failed to organize photos: {e}"),
                )
            }
            Err(e) => {
                error!("organize_photos task failed: {}", e);
                ToolResult::failure(
                    ErrorCode::NativeToolError,
                    format!("Failed to organize photos: {e}"),
                )
            }
        }
    }
}
