use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use image::GrayImage;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

const SCREEN_PATH: &str = "screen.png";
const ADB_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_BACK_ATTEMPTS: u32 = 5;

#[derive(Parser, Debug)]
#[command(
    name = "adb-album-fetch",
    version,
    about = "Download every photo from a touchscreen photo-album app over ADB by template-matching UI glyphs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Walk the album list and download every photo in every entry
    Run(RunArgs),
    /// Capture one screenshot from the device
    Capture(CaptureArgs),
    /// Match one glyph against a frame and print the matches as JSON
    Locate(LocateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Navigate and scroll normally but never tap a download affordance
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Device serial passed to adb -s
    #[arg(long)]
    serial: Option<String>,
    /// adb executable to invoke
    #[arg(long, default_value = "adb")]
    adb_bin: String,
    /// Directory holding the glyph template images
    #[arg(long, default_value = "templates")]
    templates_dir: PathBuf,
    /// Minimum match confidence in [0, 1]
    #[arg(long, default_value_t = 0.8)]
    threshold: f64,
    /// Bounding-box overlap fraction above which candidate matches collapse
    #[arg(long, default_value_t = 0.3)]
    overlap: f64,
    /// Maximum perception cycles spent inside one entry
    #[arg(long, default_value_t = 100)]
    entry_budget: u32,
    /// Maximum entries walked before giving up
    #[arg(long, default_value_t = 10_000)]
    list_budget: u32,
    /// Milliseconds to wait after each gesture
    #[arg(long, default_value_t = 1000)]
    settle_ms: u64,
    /// Keep a timestamped copy of every captured frame in this directory
    #[arg(long)]
    frames_dir: Option<PathBuf>,
    /// Print the run summary as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct CaptureArgs {
    /// Output PNG path
    #[arg(long, default_value = SCREEN_PATH)]
    out: PathBuf,
    /// Device serial passed to adb -s
    #[arg(long)]
    serial: Option<String>,
    /// adb executable to invoke
    #[arg(long, default_value = "adb")]
    adb_bin: String,
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Glyph to look for: close-photo|entry-end|download|back|load-more|advance-entry
    glyph: String,
    /// Match against a saved frame instead of taking a fresh capture
    #[arg(long)]
    frame: Option<PathBuf>,
    /// Directory holding the glyph template images
    #[arg(long, default_value = "templates")]
    templates_dir: PathBuf,
    /// Minimum match confidence in [0, 1]
    #[arg(long, default_value_t = 0.8)]
    threshold: f64,
    /// Bounding-box overlap fraction above which candidate matches collapse
    #[arg(long, default_value_t = 0.3)]
    overlap: f64,
    /// Device serial passed to adb -s
    #[arg(long)]
    serial: Option<String>,
    /// adb executable to invoke
    #[arg(long, default_value = "adb")]
    adb_bin: String,
}

/// One recognizable UI affordance, resolved to a template image by filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Glyph {
    ClosePhoto,
    EntryEnd,
    Download,
    Back,
    LoadMore,
    AdvanceEntry,
}

impl Glyph {
    const ALL: [Glyph; 6] = [
        Glyph::ClosePhoto,
        Glyph::EntryEnd,
        Glyph::Download,
        Glyph::Back,
        Glyph::LoadMore,
        Glyph::AdvanceEntry,
    ];

    fn label(self) -> &'static str {
        match self {
            Glyph::ClosePhoto => "close-photo",
            Glyph::EntryEnd => "entry-end",
            Glyph::Download => "download",
            Glyph::Back => "back",
            Glyph::LoadMore => "load-more",
            Glyph::AdvanceEntry => "advance-entry",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Glyph::ClosePhoto => "closepic.png",
            Glyph::EntryEnd => "add_your_comment.png",
            Glyph::Download => "download.png",
            Glyph::Back => "back.png",
            Glyph::LoadMore => "loadmore.png",
            Glyph::AdvanceEntry => "right.png",
        }
    }

    fn from_label(label: &str) -> Option<Glyph> {
        Glyph::ALL.iter().copied().find(|g| g.label() == label)
    }
}

#[derive(Debug)]
struct TemplateSet {
    templates: HashMap<Glyph, GrayImage>,
}

impl TemplateSet {
    fn load(dir: &Path) -> Result<Self> {
        let mut templates = HashMap::new();
        for glyph in Glyph::ALL {
            let path = dir.join(glyph.file_name());
            let template = image::open(&path)
                .with_context(|| {
                    format!(
                        "failed to load {} template: {}",
                        glyph.label(),
                        path.display()
                    )
                })?
                .to_luma8();
            templates.insert(glyph, template);
        }
        Ok(Self { templates })
    }

    fn get(&self, glyph: Glyph) -> &GrayImage {
        &self.templates[&glyph]
    }
}

/// A located glyph instance: confidence score, top-left corner, template-sized
/// bounding box, and the box centroid in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct Match {
    score: f64,
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    center_x: u32,
    center_y: u32,
}

/// All matches produced from a single captured frame.
#[derive(Debug, Clone)]
struct Observation {
    matches: Vec<(Glyph, Vec<Match>)>,
}

impl Observation {
    fn all(&self, glyph: Glyph) -> &[Match] {
        self.matches
            .iter()
            .find(|(g, _)| *g == glyph)
            .map(|(_, found)| found.as_slice())
            .unwrap_or(&[])
    }

    fn first(&self, glyph: Glyph) -> Option<Match> {
        self.all(glyph).first().copied()
    }

    fn best(&self, glyph: Glyph) -> Option<Match> {
        self.all(glyph)
            .iter()
            .copied()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
    }
}

#[derive(Debug, Error)]
enum CaptureError {
    #[error("screen capture failed: {0}")]
    Bridge(String),
    #[error("screen capture produced an undecodable image: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
#[error("gesture dispatch failed ({gesture}): {message}")]
struct GestureDispatchError {
    gesture: String,
    message: String,
}

/// The device side of the perception/control loop. One synchronous command in
/// flight at a time; gestures report dispatch success only.
trait DeviceBridge {
    fn capture(&mut self) -> Result<GrayImage, CaptureError>;
    fn tap(&mut self, x: u32, y: u32) -> Result<(), GestureDispatchError>;
    fn swipe(
        &mut self,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: u64,
    ) -> Result<(), GestureDispatchError>;
}

struct AdbBridge {
    adb_bin: String,
    serial: Option<String>,
    screen_path: PathBuf,
    frames_dir: Option<PathBuf>,
}

impl AdbBridge {
    fn new(
        adb_bin: String,
        serial: Option<String>,
        screen_path: PathBuf,
        frames_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            adb_bin,
            serial,
            screen_path,
            frames_dir,
        }
    }

    fn run_adb(&self, args: &[&str]) -> Result<Vec<u8>, String> {
        let mut cmd = Command::new(&self.adb_bin);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| format!("failed to spawn {}: {err}", self.adb_bin))?;

        // Drain stdout before waiting; screencap output is larger than the pipe buffer.
        let mut stdout = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            if let Err(err) = pipe.read_to_end(&mut stdout) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("failed to read adb output: {err}"));
            }
        }

        match child.wait_timeout(Duration::from_millis(ADB_TIMEOUT_MS)) {
            Ok(Some(status)) if status.success() => Ok(stdout),
            Ok(Some(status)) => {
                let mut stderr = Vec::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_end(&mut stderr);
                }
                let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                Err(if stderr.is_empty() {
                    format!("adb exited with status {}", status.code().unwrap_or(1))
                } else {
                    stderr
                })
            }
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(format!("adb timed out after {ADB_TIMEOUT_MS}ms"))
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(format!("failed to wait for adb: {err}"))
            }
        }
    }

    fn capture_raw(&self) -> Result<Vec<u8>, CaptureError> {
        let png = self
            .run_adb(&["exec-out", "screencap", "-p"])
            .map_err(CaptureError::Bridge)?;
        if png.is_empty() {
            return Err(CaptureError::Bridge(
                "screencap produced no data".to_string(),
            ));
        }
        Ok(png)
    }

    // Diagnostics only; a failed write never fails the capture.
    fn stash_frame(&self, png: &[u8]) {
        if let Err(err) = ensure_parent_dir(&self.screen_path) {
            eprintln!("warning: {err:#}");
        } else if let Err(err) = fs::write(&self.screen_path, png) {
            eprintln!(
                "warning: failed to write {}: {err}",
                self.screen_path.display()
            );
        }

        if let Some(dir) = &self.frames_dir {
            let name = format!(
                "frame-{}-{}-{}.png",
                timestamp_compact(),
                std::process::id(),
                rand::thread_rng().gen_range(1000..9999)
            );
            let path = dir.join(name);
            if let Err(err) = fs::create_dir_all(dir).and_then(|_| fs::write(&path, png)) {
                eprintln!("warning: failed to archive frame {}: {err}", path.display());
            }
        }
    }
}

impl DeviceBridge for AdbBridge {
    fn capture(&mut self) -> Result<GrayImage, CaptureError> {
        let png = self.capture_raw()?;
        let frame = image::load_from_memory(&png)
            .map_err(|err| CaptureError::Decode(err.to_string()))?
            .to_luma8();
        self.stash_frame(&png);
        Ok(frame)
    }

    fn tap(&mut self, x: u32, y: u32) -> Result<(), GestureDispatchError> {
        self.run_adb(&["shell", "input", "tap", &x.to_string(), &y.to_string()])
            .map(|_| ())
            .map_err(|message| GestureDispatchError {
                gesture: format!("tap {x},{y}"),
                message,
            })
    }

    fn swipe(
        &mut self,
        from: (u32, u32),
        to: (u32, u32),
        duration_ms: u64,
    ) -> Result<(), GestureDispatchError> {
        self.run_adb(&[
            "shell",
            "input",
            "swipe",
            &from.0.to_string(),
            &from.1.to_string(),
            &to.0.to_string(),
            &to.1.to_string(),
            &duration_ms.to_string(),
        ])
        .map(|_| ())
        .map_err(|message| GestureDispatchError {
            gesture: format!("swipe {},{} -> {},{}", from.0, from.1, to.0, to.1),
            message,
        })
    }
}

/// Swipe geometry for the album layout. All vertical scrolls run down the
/// same column; targets are the resting line for the next photo or entry row.
#[derive(Debug, Clone, Copy)]
struct ScrollPlan {
    column_x: u32,
    photo_step_y: u32,
    entry_step_y: u32,
    fallback_from_y: u32,
    duration_ms: u64,
}

impl Default for ScrollPlan {
    fn default() -> Self {
        Self {
            column_x: 500,
            photo_step_y: 495,
            entry_step_y: 450,
            fallback_from_y: 2200,
            duration_ms: 1000,
        }
    }
}

#[derive(Debug, Clone)]
struct Config {
    threshold: f64,
    overlap: f64,
    entry_budget: u32,
    list_budget: u32,
    back_attempts: u32,
    settle: Duration,
    scroll: ScrollPlan,
}

#[derive(Debug, Default, Clone, Serialize)]
struct RunStats {
    entries_opened: u32,
    entries_aborted: u32,
    downloads_tapped: u32,
    downloads_skipped: u32,
    scrolls: u32,
    capture_failures: u32,
    gesture_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    EntryEndReached,
    Aborted,
}

#[derive(Debug, Error)]
enum WalkError {
    #[error("device bridge unavailable at startup: {0}")]
    Startup(#[from] CaptureError),
    #[error("no advance affordance visible; the template set probably does not match this layout")]
    NoProgress,
    #[error("list budget of {0} iterations exhausted before the end-of-list marker appeared")]
    BudgetExhausted(u32),
}

struct Driver<B> {
    bridge: B,
    templates: TemplateSet,
    config: Config,
    stats: RunStats,
}

impl<B: DeviceBridge> Driver<B> {
    fn new(bridge: B, templates: TemplateSet, config: Config) -> Self {
        Self {
            bridge,
            templates,
            config,
            stats: RunStats::default(),
        }
    }

    /// One perception cycle: exactly one fresh frame, matched against the
    /// requested glyphs. Capture failures propagate; retrying is the caller's
    /// decision.
    fn observe(&mut self, glyphs: &[Glyph]) -> Result<Observation, CaptureError> {
        let frame = self.bridge.capture()?;
        Ok(inspect_frame(
            &frame,
            &self.templates,
            glyphs,
            self.config.threshold,
            self.config.overlap,
        ))
    }

    fn settle(&self) {
        if !self.config.settle.is_zero() {
            thread::sleep(self.config.settle);
        }
    }

    fn tap(&mut self, x: u32, y: u32) {
        if let Err(err) = self.bridge.tap(x, y) {
            eprintln!("warning: {err}");
            self.stats.gesture_failures += 1;
        }
    }

    fn swipe(&mut self, from: (u32, u32), to: (u32, u32)) {
        self.stats.scrolls += 1;
        if let Err(err) = self.bridge.swipe(from, to, self.config.scroll.duration_ms) {
            eprintln!("warning: {err}");
            self.stats.gesture_failures += 1;
        }
    }

    fn scroll_one_photo(&mut self, anchor_y: u32) {
        let plan = self.config.scroll;
        self.swipe((plan.column_x, anchor_y), (plan.column_x, plan.photo_step_y));
    }

    fn scroll_one_entry(&mut self, anchor_y: u32) {
        let plan = self.config.scroll;
        self.swipe((plan.column_x, anchor_y), (plan.column_x, plan.entry_step_y));
    }

    fn scroll_fallback(&mut self) {
        let plan = self.config.scroll;
        self.swipe(
            (plan.column_x, plan.fallback_from_y),
            (plan.column_x, plan.photo_step_y),
        );
    }

    fn tap_download(&mut self, found: Match, dry_run: bool) {
        if dry_run {
            println!(
                "dry run: skipping download at ({}, {})",
                found.center_x, found.center_y
            );
            self.stats.downloads_skipped += 1;
            return;
        }
        println!(
            "downloading photo at ({}, {})",
            found.center_x, found.center_y
        );
        self.tap(found.center_x, found.center_y);
        self.stats.downloads_tapped += 1;
        self.settle();
    }

    /// Downloads every photo in the currently open entry, then returns to the
    /// entry list. Every decision is made from the latest frame alone; the
    /// machine degrades to `Aborted` after `entry_budget` perception cycles.
    fn download_entry(&mut self, dry_run: bool) -> EntryOutcome {
        let mut outcome = EntryOutcome::Aborted;

        for _ in 0..self.config.entry_budget {
            let observed =
                match self.observe(&[Glyph::ClosePhoto, Glyph::EntryEnd, Glyph::Download]) {
                    Ok(observed) => observed,
                    Err(err) => {
                        eprintln!("warning: {err}");
                        self.stats.capture_failures += 1;
                        self.settle();
                        continue;
                    }
                };

            // A stray tap sometimes opens a photo full-screen, hiding the list.
            if let Some(found) = observed.best(Glyph::ClosePhoto) {
                println!("closing an accidentally opened photo");
                self.tap(found.center_x, found.center_y);
                self.settle();
                continue;
            }

            // The comment composer only renders below the last photo.
            if observed.best(Glyph::EntryEnd).is_some() {
                for found in observed.all(Glyph::Download).iter().copied() {
                    self.tap_download(found, dry_run);
                }
                outcome = EntryOutcome::EntryEndReached;
                break;
            }

            if let Some(found) = observed.first(Glyph::Download) {
                self.tap_download(found, dry_run);
                self.scroll_one_photo(found.center_y);
            } else {
                // Nothing actionable on screen; the rest of the entry is below the fold.
                self.scroll_fallback();
            }
            self.settle();
        }

        self.recover_to_list();
        outcome
    }

    // The post-download toast can sit over the back affordance, hence the retries.
    fn recover_to_list(&mut self) {
        for _ in 0..self.config.back_attempts {
            let observed = match self.observe(&[Glyph::Back]) {
                Ok(observed) => observed,
                Err(err) => {
                    eprintln!("warning: {err}");
                    self.stats.capture_failures += 1;
                    break;
                }
            };
            if let Some(found) = observed.best(Glyph::Back) {
                self.tap(found.center_x, found.center_y);
                self.settle();
                break;
            }
            self.settle();
        }
    }

    /// Walks the entry list top to bottom, running the per-entry download
    /// machine for each row until the end-of-list marker appears.
    fn walk(&mut self, dry_run: bool) -> Result<(), WalkError> {
        // Bridge availability is checked once up front; later capture failures
        // only consume loop budget.
        self.bridge.capture()?;

        for _ in 0..self.config.list_budget {
            match self.observe(&[Glyph::LoadMore]) {
                Ok(observed) if observed.best(Glyph::LoadMore).is_some() => {
                    println!("end-of-list marker visible; all entries handled");
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    eprintln!("warning: {err}");
                    self.stats.capture_failures += 1;
                    self.settle();
                    continue;
                }
            }

            let observed = match self.observe(&[Glyph::AdvanceEntry]) {
                Ok(observed) => observed,
                Err(err) => {
                    eprintln!("warning: {err}");
                    self.stats.capture_failures += 1;
                    self.settle();
                    continue;
                }
            };
            let Some(advance) = observed.first(Glyph::AdvanceEntry) else {
                return Err(WalkError::NoProgress);
            };

            println!(
                "opening entry at ({}, {})",
                advance.center_x, advance.center_y
            );
            self.tap(advance.center_x, advance.center_y);
            self.settle();
            self.stats.entries_opened += 1;

            if self.download_entry(dry_run) == EntryOutcome::Aborted {
                self.stats.entries_aborted += 1;
                eprintln!("warning: entry scan budget exhausted; moving to the next entry");
            }

            self.scroll_one_entry(advance.center_y);
            self.settle();
        }

        Err(WalkError::BudgetExhausted(self.config.list_budget))
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => command_run(args),
        Commands::Capture(args) => command_capture(args),
        Commands::Locate(args) => command_locate(args),
    }
}

fn command_run(args: RunArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.threshold) {
        bail!("--threshold must be in [0, 1], got {}", args.threshold);
    }
    if !(0.0..=1.0).contains(&args.overlap) {
        bail!("--overlap must be in [0, 1], got {}", args.overlap);
    }

    let templates = TemplateSet::load(&args.templates_dir)?;
    let bridge = AdbBridge::new(
        args.adb_bin,
        args.serial,
        PathBuf::from(SCREEN_PATH),
        args.frames_dir,
    );
    let config = Config {
        threshold: args.threshold,
        overlap: args.overlap,
        entry_budget: args.entry_budget,
        list_budget: args.list_budget,
        back_attempts: DEFAULT_BACK_ATTEMPTS,
        settle: Duration::from_millis(args.settle_ms),
        scroll: ScrollPlan::default(),
    };

    if args.dry_run {
        println!("dry run: download taps will be skipped");
    }

    let mut driver = Driver::new(bridge, templates, config);
    let result = driver.walk(args.dry_run);

    let outcome = match &result {
        Ok(()) => "list-exhausted",
        Err(WalkError::Startup(_)) => "startup-failure",
        Err(WalkError::NoProgress) => "no-progress",
        Err(WalkError::BudgetExhausted(_)) => "budget-exhausted",
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "finished_at": timestamp_iso(),
                "outcome": outcome,
                "dry_run": args.dry_run,
                "stats": &driver.stats,
            }))?
        );
    } else {
        let stats = &driver.stats;
        println!(
            "{outcome}: {} entries opened ({} aborted), {} downloads tapped, {} skipped, {} scrolls, {} capture failures, {} gesture failures",
            stats.entries_opened,
            stats.entries_aborted,
            stats.downloads_tapped,
            stats.downloads_skipped,
            stats.scrolls,
            stats.capture_failures,
            stats.gesture_failures
        );
    }

    result.map_err(Into::into)
}

fn command_capture(args: CaptureArgs) -> Result<()> {
    let bridge = AdbBridge::new(args.adb_bin, args.serial, args.out.clone(), None);
    let png = bridge.capture_raw()?;
    let frame = image::load_from_memory(&png)
        .context("screencap produced an undecodable image")?
        .to_luma8();
    // Unlike the walk's diagnostic stash, here the file is the whole point.
    ensure_parent_dir(&args.out)?;
    fs::write(&args.out, &png)
        .with_context(|| format!("failed to write {}", args.out.display()))?;
    println!(
        "{} ({}x{})",
        abs_path(&args.out).display(),
        frame.width(),
        frame.height()
    );
    Ok(())
}

fn command_locate(args: LocateArgs) -> Result<()> {
    if !(0.0..=1.0).contains(&args.threshold) {
        bail!("--threshold must be in [0, 1], got {}", args.threshold);
    }
    if !(0.0..=1.0).contains(&args.overlap) {
        bail!("--overlap must be in [0, 1], got {}", args.overlap);
    }

    let glyph = Glyph::from_label(&args.glyph).with_context(|| {
        format!(
            "unknown glyph {:?}; expected one of close-photo, entry-end, download, back, load-more, advance-entry",
            args.glyph
        )
    })?;
    let templates = TemplateSet::load(&args.templates_dir)?;

    let (frame, source) = match &args.frame {
        Some(path) => {
            let frame = image::open(path)
                .with_context(|| format!("failed to open frame: {}", path.display()))?
                .to_luma8();
            (frame, abs_path(path).display().to_string())
        }
        None => {
            let mut bridge =
                AdbBridge::new(args.adb_bin, args.serial, PathBuf::from(SCREEN_PATH), None);
            (bridge.capture()?, "live capture".to_string())
        }
    };

    let matches = find_matches(&frame, templates.get(glyph), args.threshold, args.overlap);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "glyph": glyph.label(),
            "frame": source,
            "frame_size": { "w": frame.width(), "h": frame.height() },
            "threshold": args.threshold,
            "overlap": args.overlap,
            "match_count": matches.len(),
            "matches": matches,
        }))?
    );
    Ok(())
}

fn inspect_frame(
    frame: &GrayImage,
    templates: &TemplateSet,
    glyphs: &[Glyph],
    threshold: f64,
    overlap: f64,
) -> Observation {
    let matches = glyphs
        .iter()
        .map(|&glyph| {
            (
                glyph,
                find_matches(frame, templates.get(glyph), threshold, overlap),
            )
        })
        .collect();
    Observation { matches }
}

/// Zero-mean normalized cross-correlation of `template` over `frame`. Returns
/// every position scoring at or above `threshold`, deduplicated by overlap
/// suppression. Survivors come back in scan order (top-to-bottom then
/// left-to-right); callers must only rely on that for "first visible"
/// heuristics.
///
/// This is a plain pixel scan, O(frame area x template area) per call, so
/// perception-cycle latency scales with template size. Keep templates tight
/// crops of the glyph; on a full-resolution screencap a large template can
/// push one observation into the seconds range.
fn find_matches(frame: &GrayImage, template: &GrayImage, threshold: f64, overlap: f64) -> Vec<Match> {
    let (fw, fh) = frame.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return Vec::new();
    }

    let pixels = (tw * th) as f64;
    let template_mean =
        template.pixels().map(|p| p.0[0] as f64).sum::<f64>() / pixels;
    let mut centered = Vec::with_capacity((tw * th) as usize);
    let mut template_energy = 0.0;
    for p in template.pixels() {
        let v = p.0[0] as f64 - template_mean;
        template_energy += v * v;
        centered.push(v);
    }
    // A flat template correlates with nothing.
    if template_energy <= f64::EPSILON {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for y in 0..=(fh - th) {
        for x in 0..=(fw - tw) {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            let mut cross = 0.0;
            for ty in 0..th {
                for tx in 0..tw {
                    let v = frame.get_pixel(x + tx, y + ty).0[0] as f64;
                    sum += v;
                    sum_sq += v * v;
                    cross += v * centered[(ty * tw + tx) as usize];
                }
            }
            let window_energy = sum_sq - sum * sum / pixels;
            if window_energy <= f64::EPSILON {
                continue;
            }
            let score = cross / (window_energy * template_energy).sqrt();
            if score >= threshold {
                candidates.push(Match {
                    score: score.min(1.0),
                    x,
                    y,
                    w: tw,
                    h: th,
                    center_x: x + tw / 2,
                    center_y: y + th / 2,
                });
            }
        }
    }

    suppress_overlaps(candidates, overlap)
}

fn suppress_overlaps(mut candidates: Vec<Match>, overlap: f64) -> Vec<Match> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Match> = Vec::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|found| overlap_fraction(found, &candidate) <= overlap)
        {
            kept.push(candidate);
        }
    }

    kept.sort_by_key(|found| (found.y, found.x));
    kept
}

fn overlap_fraction(a: &Match, b: &Match) -> f64 {
    let ix = (a.x + a.w).min(b.x + b.w).saturating_sub(a.x.max(b.x));
    let iy = (a.y + a.h).min(b.y + b.h).saturating_sub(a.y.max(b.y));
    let intersection = (ix as u64) * (iy as u64);
    let smaller = ((a.w as u64) * (a.h as u64)).min((b.w as u64) * (b.h as u64));
    if smaller == 0 {
        return 0.0;
    }
    intersection as f64 / smaller as f64
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    fn pattern_value(x: u32, y: u32, seed: u32) -> u8 {
        let mut h = x.wrapping_mul(0x9E37_79B1)
            ^ y.wrapping_mul(0x85EB_CA77)
            ^ seed.wrapping_mul(0xC2B2_AE3D);
        h ^= h >> 15;
        h = h.wrapping_mul(0x2C1B_3C6D);
        h ^= h >> 12;
        (h & 0xFF) as u8
    }

    fn glyph_pattern(seed: u32) -> GrayImage {
        GrayImage::from_fn(8, 8, |x, y| Luma([pattern_value(x, y, seed)]))
    }

    fn test_templates() -> TemplateSet {
        let templates = Glyph::ALL
            .iter()
            .enumerate()
            .map(|(idx, &glyph)| (glyph, glyph_pattern(idx as u32 + 1)))
            .collect();
        TemplateSet { templates }
    }

    fn blank_frame(w: u32, h: u32) -> GrayImage {
        GrayImage::from_pixel(w, h, Luma([24]))
    }

    fn paste(frame: &mut GrayImage, templates: &TemplateSet, glyph: Glyph, x: u32, y: u32) {
        let template = templates.get(glyph);
        for (tx, ty, pixel) in template.enumerate_pixels() {
            frame.put_pixel(x + tx, y + ty, *pixel);
        }
    }

    #[derive(Default)]
    struct ScriptedBridge {
        frames: VecDeque<GrayImage>,
        repeat_last: bool,
        fail_gestures: bool,
        capture_errors_at: Vec<u32>,
        captures: u32,
        taps: Vec<(u32, u32)>,
        swipes: Vec<((u32, u32), (u32, u32), u64)>,
    }

    impl ScriptedBridge {
        fn new(frames: Vec<GrayImage>, repeat_last: bool) -> Self {
            Self {
                frames: frames.into(),
                repeat_last,
                ..Default::default()
            }
        }
    }

    impl DeviceBridge for ScriptedBridge {
        fn capture(&mut self) -> Result<GrayImage, CaptureError> {
            self.captures += 1;
            if self.capture_errors_at.contains(&self.captures) {
                return Err(CaptureError::Bridge("scripted capture failure".to_string()));
            }
            let frame = if self.frames.len() > 1 || !self.repeat_last {
                self.frames.pop_front()
            } else {
                self.frames.front().cloned()
            };
            frame.ok_or_else(|| CaptureError::Bridge("scripted frame queue empty".to_string()))
        }

        fn tap(&mut self, x: u32, y: u32) -> Result<(), GestureDispatchError> {
            self.taps.push((x, y));
            if self.fail_gestures {
                return Err(GestureDispatchError {
                    gesture: format!("tap {x},{y}"),
                    message: "scripted dispatch failure".to_string(),
                });
            }
            Ok(())
        }

        fn swipe(
            &mut self,
            from: (u32, u32),
            to: (u32, u32),
            duration_ms: u64,
        ) -> Result<(), GestureDispatchError> {
            self.swipes.push((from, to, duration_ms));
            if self.fail_gestures {
                return Err(GestureDispatchError {
                    gesture: format!("swipe {},{} -> {},{}", from.0, from.1, to.0, to.1),
                    message: "scripted dispatch failure".to_string(),
                });
            }
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            threshold: 0.8,
            overlap: 0.3,
            entry_budget: 100,
            list_budget: 10_000,
            back_attempts: 5,
            settle: Duration::ZERO,
            scroll: ScrollPlan::default(),
        }
    }

    fn driver_with(
        frames: Vec<GrayImage>,
        repeat_last: bool,
        config: Config,
    ) -> Driver<ScriptedBridge> {
        Driver::new(
            ScriptedBridge::new(frames, repeat_last),
            test_templates(),
            config,
        )
    }

    #[test]
    fn absent_glyph_yields_no_matches() {
        let templates = test_templates();
        let mut frame = blank_frame(120, 120);
        paste(&mut frame, &templates, Glyph::Download, 30, 30);

        let matches = find_matches(&frame, templates.get(Glyph::Back), 0.8, 0.3);
        assert!(matches.is_empty());
    }

    #[test]
    fn finds_every_distinct_instance() {
        let templates = test_templates();
        let mut frame = blank_frame(150, 150);
        let spots = [(10, 10), (60, 10), (10, 80)];
        for (x, y) in spots {
            paste(&mut frame, &templates, Glyph::Download, x, y);
        }

        let matches = find_matches(&frame, templates.get(Glyph::Download), 0.8, 0.3);
        assert_eq!(matches.len(), 3);
        for (found, (x, y)) in matches.iter().zip(spots) {
            assert_eq!((found.x, found.y), (x, y));
            assert!(found.score > 0.99);
            assert!(found.center_x >= x && found.center_x < x + 8);
            assert!(found.center_y >= y && found.center_y < y + 8);
        }
    }

    #[test]
    fn overlapping_candidates_collapse_to_one() {
        fn mk(x: u32, y: u32, score: f64) -> Match {
            Match {
                score,
                x,
                y,
                w: 10,
                h: 10,
                center_x: x + 5,
                center_y: y + 5,
            }
        }

        let kept = suppress_overlaps(vec![mk(0, 0, 0.92), mk(2, 0, 0.85)], 0.3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].x, 0);

        let kept = suppress_overlaps(vec![mk(0, 0, 0.92), mk(40, 0, 0.85)], 0.3);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn degenerate_templates_never_match() {
        let frame = blank_frame(50, 50);

        let flat = GrayImage::from_pixel(8, 8, Luma([100]));
        assert!(find_matches(&frame, &flat, 0.5, 0.3).is_empty());

        let oversized = glyph_pattern(9);
        let tiny_frame = blank_frame(4, 4);
        assert!(find_matches(&tiny_frame, &oversized, 0.5, 0.3).is_empty());
    }

    #[test]
    fn inspecting_a_stored_frame_is_idempotent() {
        let templates = test_templates();
        let mut frame = blank_frame(150, 150);
        paste(&mut frame, &templates, Glyph::Download, 20, 20);
        paste(&mut frame, &templates, Glyph::Download, 90, 70);

        let glyphs = [Glyph::Download, Glyph::Back];
        let a = inspect_frame(&frame, &templates, &glyphs, 0.8, 0.3);
        let b = inspect_frame(&frame, &templates, &glyphs, 0.8, 0.3);
        assert_eq!(a.matches, b.matches);
        assert_eq!(a.all(Glyph::Download).len(), 2);
        assert!(a.best(Glyph::Back).is_none());
    }

    #[test]
    fn template_store_requires_every_glyph() {
        let dir = tempdir().unwrap();
        for (idx, glyph) in Glyph::ALL.iter().enumerate() {
            if *glyph == Glyph::Back {
                continue;
            }
            glyph_pattern(idx as u32 + 1)
                .save(dir.path().join(glyph.file_name()))
                .unwrap();
        }

        let err = TemplateSet::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("back.png"));

        glyph_pattern(42)
            .save(dir.path().join(Glyph::Back.file_name()))
            .unwrap();
        let templates = TemplateSet::load(dir.path()).unwrap();
        assert_eq!(templates.get(Glyph::Download).dimensions(), (8, 8));
    }

    #[test]
    fn entry_machine_downloads_across_scroll() {
        let templates = test_templates();

        let mut frame1 = blank_frame(200, 260);
        paste(&mut frame1, &templates, Glyph::Download, 40, 40);
        paste(&mut frame1, &templates, Glyph::Download, 40, 120);

        let mut frame2 = blank_frame(200, 260);
        paste(&mut frame2, &templates, Glyph::EntryEnd, 20, 200);
        paste(&mut frame2, &templates, Glyph::Download, 40, 60);

        let trailer = blank_frame(200, 260);
        let mut driver = driver_with(vec![frame1, frame2, trailer], true, test_config());

        let outcome = driver.download_entry(false);
        assert_eq!(outcome, EntryOutcome::EntryEndReached);

        // First visible download from frame 1, then the remaining one from
        // frame 2; the already-handled position is never tapped again.
        assert_eq!(driver.bridge.taps, vec![(44, 44), (44, 64)]);
        assert!(!driver.bridge.taps.contains(&(44, 124)));
        assert_eq!(driver.stats.downloads_tapped, 2);

        assert_eq!(driver.bridge.swipes.len(), 1);
        assert_eq!(driver.bridge.swipes[0], ((500, 44), (500, 495), 1000));
    }

    #[test]
    fn failed_gestures_do_not_derail_the_entry_machine() {
        let templates = test_templates();

        let mut frame1 = blank_frame(200, 260);
        paste(&mut frame1, &templates, Glyph::Download, 40, 40);

        let mut frame2 = blank_frame(200, 260);
        paste(&mut frame2, &templates, Glyph::EntryEnd, 20, 200);
        paste(&mut frame2, &templates, Glyph::Download, 40, 60);

        let trailer = blank_frame(200, 260);
        let mut bridge = ScriptedBridge::new(vec![frame1, frame2, trailer], true);
        bridge.fail_gestures = true;
        let mut driver = Driver::new(bridge, templates, test_config());

        // Every dispatch fails, but the next observation re-derives state, so
        // the machine still runs to its terminal.
        let outcome = driver.download_entry(false);
        assert_eq!(outcome, EntryOutcome::EntryEndReached);

        assert_eq!(driver.bridge.taps, vec![(44, 44), (44, 64)]);
        assert_eq!(driver.bridge.swipes.len(), 1);
        assert_eq!(driver.stats.downloads_tapped, 2);
        assert_eq!(driver.stats.gesture_failures, 3);
    }

    fn walk_script(templates: &TemplateSet) -> Vec<GrayImage> {
        let mut advance_frame = blank_frame(200, 300);
        paste(&mut advance_frame, templates, Glyph::AdvanceEntry, 20, 30);

        let mut entry_frame = blank_frame(200, 300);
        paste(&mut entry_frame, templates, Glyph::EntryEnd, 20, 200);
        paste(&mut entry_frame, templates, Glyph::Download, 40, 60);

        let mut end_frame = blank_frame(200, 300);
        paste(&mut end_frame, templates, Glyph::LoadMore, 50, 50);

        vec![
            blank_frame(200, 300), // startup probe
            blank_frame(200, 300), // first load-more check
            advance_frame,
            entry_frame,
            end_frame, // served repeatedly: back recovery, then end-of-list
        ]
    }

    #[test]
    fn dry_run_suppresses_download_taps_only() {
        let templates = test_templates();
        let mut driver = driver_with(walk_script(&templates), true, test_config());

        driver.walk(true).unwrap();

        // The navigation tap on the advance affordance still happens.
        assert_eq!(driver.bridge.taps, vec![(24, 34)]);
        assert_eq!(driver.stats.downloads_tapped, 0);
        assert_eq!(driver.stats.downloads_skipped, 1);
        // The list row scroll still happens.
        assert_eq!(driver.bridge.swipes, vec![((500, 34), (500, 450), 1000)]);
    }

    #[test]
    fn live_run_taps_the_downloads() {
        let templates = test_templates();
        let mut driver = driver_with(walk_script(&templates), true, test_config());

        driver.walk(false).unwrap();

        assert_eq!(driver.bridge.taps, vec![(24, 34), (44, 64)]);
        assert_eq!(driver.stats.downloads_tapped, 1);
        assert_eq!(driver.stats.entries_opened, 1);
        assert_eq!(driver.stats.entries_aborted, 0);
    }

    #[test]
    fn walker_rides_out_a_transient_capture_failure() {
        let templates = test_templates();
        let mut bridge = ScriptedBridge::new(walk_script(&templates), true);
        // The capture after the startup probe fails once, then the bridge
        // recovers; the iteration is consumed, not the run.
        bridge.capture_errors_at = vec![2];
        let mut driver = Driver::new(bridge, templates, test_config());

        driver.walk(false).unwrap();

        assert_eq!(driver.stats.capture_failures, 1);
        assert_eq!(driver.stats.downloads_tapped, 1);
        assert_eq!(driver.bridge.taps, vec![(24, 34), (44, 64)]);
    }

    #[test]
    fn entry_machine_aborts_after_its_budget() {
        let mut config = test_config();
        config.entry_budget = 7;
        let mut driver = driver_with(vec![blank_frame(100, 100)], true, config);

        let outcome = driver.download_entry(false);
        assert_eq!(outcome, EntryOutcome::Aborted);

        // One fallback scroll per cycle, then the bounded back recovery.
        assert_eq!(driver.bridge.swipes.len(), 7);
        for swipe in &driver.bridge.swipes {
            assert_eq!(*swipe, ((500, 2200), (500, 495), 1000));
        }
        assert_eq!(driver.bridge.captures, 7 + 5);
        assert!(driver.bridge.taps.is_empty());
    }

    #[test]
    fn walker_fails_fast_without_progress() {
        let mut driver = driver_with(vec![blank_frame(100, 100)], true, test_config());

        let err = driver.walk(false).unwrap_err();
        assert!(matches!(err, WalkError::NoProgress));
        // Startup probe, load-more check, advance check: one iteration only.
        assert_eq!(driver.bridge.captures, 3);
        assert!(driver.bridge.taps.is_empty());
    }

    #[test]
    fn capture_failures_consume_the_entry_budget() {
        let mut config = test_config();
        config.entry_budget = 4;
        let mut driver = driver_with(Vec::new(), false, config);

        let outcome = driver.download_entry(false);
        assert_eq!(outcome, EntryOutcome::Aborted);
        // Four failed cycles plus the first (failed) recovery attempt.
        assert_eq!(driver.bridge.captures, 5);
        assert_eq!(driver.stats.capture_failures, 5);
    }

    #[test]
    fn walker_budget_exhaustion_is_a_failure() {
        let templates = test_templates();
        let mut advance_frame = blank_frame(150, 150);
        paste(&mut advance_frame, &templates, Glyph::AdvanceEntry, 30, 40);

        let mut config = test_config();
        config.list_budget = 2;
        config.entry_budget = 1;
        let mut driver = driver_with(vec![advance_frame], true, config);

        let err = driver.walk(true).unwrap_err();
        assert!(matches!(err, WalkError::BudgetExhausted(2)));
        assert_eq!(driver.stats.entries_opened, 2);
        assert_eq!(driver.stats.entries_aborted, 2);
    }

    #[test]
    fn glyph_labels_round_trip() {
        for glyph in Glyph::ALL {
            assert_eq!(Glyph::from_label(glyph.label()), Some(glyph));
        }
        assert!(Glyph::from_label("bogus").is_none());
    }
}
