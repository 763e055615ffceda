//! Stitch: run ASHLAR once per slide folder.
//!
//! `<input>/<slide>/<tiles...>` -> `<output>/<slide>.ome.tif`, optionally with
//! flat/dark-field profiles from `<illumination>/<slide>/`.

use clap::Args;
use rayon::prelude::*;
use regex::Regex;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use crate::error::{Error, Result};
use crate::slices;

#[derive(Args, Clone)]
pub struct StitchArgs {
    /// Folder with one subfolder of raw tiles per slide
    #[arg(long)]
    pub input: String,
    /// Output folder for <slide>.ome.tif
    #[arg(long)]
    pub output: String,
    /// Regex selecting tile files inside a slide folder (e.g. "rcpnl", "nd2")
    #[arg(long, default_value = "rcpnl")]
    pub pattern: String,
    /// Folder with per-slide illumination profiles (<dir>/<slide>/*-ffp*, *-dfp*)
    #[arg(long)]
    pub illumination: Option<String>,
    /// Slides to stitch: "all" or comma-separated indices/slices of the sorted folders
    #[arg(long, default_value = "all")]
    pub slides: String,
    /// Number of slides stitched in parallel
    #[arg(long, default_value_t = 1)]
    pub threads: usize,
    /// ASHLAR executable
    #[arg(long, default_value = "ashlar")]
    pub ashlar: String,
    /// Gaussian sigma for ASHLAR's tile filter (--filter-sigma)
    #[arg(long, default_value_t = 1.0)]
    pub filter_sigma: f64,
    /// Maximum tile shift in microns (ASHLAR -m)
    #[arg(long, default_value_t = 30.0)]
    pub maximum_shift: f64,
    /// Log the commands without running them
    #[arg(long)]
    pub dry_run: bool,
}

/// Everything needed to stitch one slide.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideJob {
    pub name: String,
    pub tiles: Vec<PathBuf>,
    pub flat_field: Vec<PathBuf>,
    pub dark_field: Vec<PathBuf>,
    pub output: PathBuf,
}

impl SlideJob {
    pub fn argv(&self, args: &StitchArgs) -> Vec<String> {
        let mut argv: Vec<String> = self
            .tiles
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        argv.push("-o".into());
        argv.push(self.output.to_string_lossy().into_owned());
        argv.push("--pyramid".into());
        argv.push("--filter-sigma".into());
        argv.push(args.filter_sigma.to_string());
        argv.push("-m".into());
        argv.push(args.maximum_shift.to_string());
        if !self.flat_field.is_empty() && !self.dark_field.is_empty() {
            argv.push("--ffp".into());
            argv.extend(self.flat_field.iter().map(|p| p.to_string_lossy().into_owned()));
            argv.push("--dfp".into());
            argv.extend(self.dark_field.iter().map(|p| p.to_string_lossy().into_owned()));
        }
        argv
    }
}

/// Natural order: digit runs compare numerically, text case-insensitively.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut ai, mut bi) = (a.chars().peekable(), b.chars().peekable());
    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let mut da = String::new();
                while let Some(c) = ai.peek().copied().filter(char::is_ascii_digit) {
                    da.push(c);
                    ai.next();
                }
                let mut db = String::new();
                while let Some(c) = bi.peek().copied().filter(char::is_ascii_digit) {
                    db.push(c);
                    bi.next();
                }
                let (ta, tb) = (da.trim_start_matches('0'), db.trim_start_matches('0'));
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                ai.next();
                bi.next();
            }
        }
    }
}

fn sorted_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|e| {
            let e = e.ok()?;
            if !e.path().is_file() {
                return None;
            }
            e.file_name().to_str().map(String::from)
        })
        .filter(|n| keep(n))
        .collect();
    names.sort_by(|a, b| natural_cmp(a, b));
    Ok(names.into_iter().map(|n| dir.join(n)).collect())
}

fn slide_dirs(input: &Path) -> Result<Vec<PathBuf>> {
    if !input.is_dir() {
        return Err(Error::NotFound(input.to_path_buf()));
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(input)?
        .filter_map(|e| {
            let e = e.ok()?;
            let path = e.path();
            path.is_dir().then_some(path)
        })
        .collect();
    dirs.sort_by(|a, b| natural_cmp(&a.to_string_lossy(), &b.to_string_lossy()));
    Ok(dirs)
}

/// Build one job per selected slide folder. Folders without tiles are skipped.
pub fn plan(args: &StitchArgs) -> Result<Vec<SlideJob>> {
    let tile_re = Regex::new(&args.pattern)?;
    let dirs = slide_dirs(Path::new(&args.input))?;
    let selected = slices::parse_selection(&args.slides, dirs.len())?;
    let output = Path::new(&args.output);

    let mut jobs = Vec::with_capacity(selected.len());
    for dir in selected.into_iter().map(|i| &dirs[i]) {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tiles = sorted_files(dir, |n| tile_re.is_match(n))?;
        if tiles.is_empty() {
            log::warn!("stitch: no files matching {:?} in {}, skipping", args.pattern, dir.display());
            continue;
        }

        let (flat_field, dark_field) = match &args.illumination {
            Some(root) => {
                let illum_dir = Path::new(root).join(&name);
                if illum_dir.is_dir() {
                    (
                        sorted_files(&illum_dir, |n| n.contains("-ffp"))?,
                        sorted_files(&illum_dir, |n| n.contains("-dfp"))?,
                    )
                } else {
                    log::warn!("stitch: no illumination folder {}", illum_dir.display());
                    (vec![], vec![])
                }
            }
            None => (vec![], vec![]),
        };
        if args.illumination.is_some() && (flat_field.is_empty() || dark_field.is_empty()) {
            log::warn!("stitch: {} stitched without illumination correction", name);
        }

        jobs.push(SlideJob {
            output: output.join(format!("{}.ome.tif", name)),
            name,
            tiles,
            flat_field,
            dark_field,
        });
    }
    Ok(jobs)
}

fn run_job(job: &SlideJob, args: &StitchArgs) -> Result<()> {
    let argv = job.argv(args);
    log::info!("{} {}", args.ashlar, argv.join(" "));
    if args.dry_run {
        return Ok(());
    }
    let status = Command::new(&args.ashlar)
        .args(&argv)
        .stdin(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(Error::ExternalTool {
            program: args.ashlar.clone(),
            target: job.name.clone(),
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

pub fn run(args: StitchArgs, progress: impl Fn(f64, &str) + Sync) -> Result<()> {
    let jobs = plan(&args)?;
    if jobs.is_empty() {
        progress(1.0, "No slides to stitch");
        return Ok(());
    }
    if !args.dry_run {
        fs::create_dir_all(&args.output)?;
    }
    log::info!(
        "stitch: {} slide(s): {}",
        jobs.len(),
        jobs.iter().map(|j| j.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads.max(1))
        .build()?;
    let total = jobs.len();
    let done = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    pool.install(|| {
        jobs.par_iter().for_each(|job| {
            if let Err(e) = run_job(job, &args) {
                log::error!("stitch: {}: {}", job.name, e);
                failed.fetch_add(1, AtomicOrdering::Relaxed);
            }
            let n = done.fetch_add(1, AtomicOrdering::Relaxed) + 1;
            progress(n as f64 / total as f64, &format!("Stitched slide {}/{}", n, total));
        })
    });

    let failed = failed.into_inner();
    if failed > 0 {
        return Err(Error::Batch {
            what: "slides",
            failed,
            total,
        });
    }
    progress(1.0, &format!("Stitched {} slide(s) into {}", total, args.output));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: StitchArgs,
    }

    fn args(extra: &[&str]) -> StitchArgs {
        let mut argv = vec!["stitch"];
        argv.extend_from_slice(extra);
        Wrapper::parse_from(argv).args
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn natural_order_compares_numbers() {
        let mut names = vec!["tile10.rcpnl", "Tile2.rcpnl", "tile1.rcpnl", "tile02b.rcpnl"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["tile1.rcpnl", "Tile2.rcpnl", "tile02b.rcpnl", "tile10.rcpnl"]);
    }

    #[test]
    fn plans_jobs_with_illumination() {
        let root = tempfile::tempdir().unwrap();
        let raw = root.path().join("raw");
        let illum = root.path().join("illum");
        touch(&raw.join("SlideA").join("cycle10.rcpnl"));
        touch(&raw.join("SlideA").join("cycle2.rcpnl"));
        touch(&raw.join("SlideA").join("notes.txt"));
        touch(&raw.join("SlideB").join("cycle1.rcpnl"));
        touch(&raw.join("Empty").join("readme.md"));
        touch(&illum.join("SlideA").join("cycle2-ffp.tif"));
        touch(&illum.join("SlideA").join("cycle2-dfp.tif"));

        let a = args(&[
            "--input",
            raw.to_str().unwrap(),
            "--output",
            "/out",
            "--illumination",
            illum.to_str().unwrap(),
        ]);
        let jobs = plan(&a).unwrap();
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["SlideA", "SlideB"]);

        let slide_a = &jobs[0];
        assert_eq!(
            slide_a.tiles,
            vec![raw.join("SlideA/cycle2.rcpnl"), raw.join("SlideA/cycle10.rcpnl")]
        );
        assert_eq!(slide_a.output, PathBuf::from("/out/SlideA.ome.tif"));

        let argv = slide_a.argv(&a);
        let tail: Vec<&str> = argv[2..9].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["-o", "/out/SlideA.ome.tif", "--pyramid", "--filter-sigma", "1", "-m", "30"]
        );
        assert!(argv.contains(&"--ffp".to_string()));
        assert!(argv.contains(&"--dfp".to_string()));

        // SlideB has no profiles, so no correction flags.
        assert!(!jobs[1].argv(&a).contains(&"--ffp".to_string()));
    }

    #[test]
    fn selects_slides_and_runs_dry() {
        let root = tempfile::tempdir().unwrap();
        for s in ["S1", "S2", "S3"] {
            touch(&root.path().join(s).join("a.nd2"));
        }
        let out = root.path().join("out");
        let a = args(&[
            "--input",
            root.path().to_str().unwrap(),
            "--output",
            out.to_str().unwrap(),
            "--pattern",
            r"\.nd2$",
            "--slides",
            "1:",
            "--dry-run",
            "--threads",
            "2",
        ]);
        let names: Vec<String> = plan(&a).unwrap().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["S2", "S3"]);
        run(a, |_, _| {}).unwrap();
        assert!(!out.exists());
    }

    #[cfg(unix)]
    #[test]
    fn follows_symlinked_slides_and_tiles() {
        use std::os::unix::fs::symlink;
        let root = tempfile::tempdir().unwrap();
        let store = root.path().join("store");
        let raw = root.path().join("raw");
        touch(&store.join("SlideA").join("t1.rcpnl"));
        touch(&store.join("t2.rcpnl"));
        touch(&raw.join("SlideB").join("t1.rcpnl"));
        symlink(store.join("SlideA"), raw.join("SlideA")).unwrap();
        symlink(store.join("t2.rcpnl"), raw.join("SlideB").join("t2.rcpnl")).unwrap();

        let a = args(&[
            "--input",
            raw.to_str().unwrap(),
            "--output",
            root.path().join("out").to_str().unwrap(),
        ]);
        let jobs = plan(&a).unwrap();
        let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["SlideA", "SlideB"]);
        assert_eq!(jobs[0].tiles, vec![raw.join("SlideA").join("t1.rcpnl")]);
        assert_eq!(
            jobs[1].tiles,
            vec![raw.join("SlideB").join("t1.rcpnl"), raw.join("SlideB").join("t2.rcpnl")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_fails_every_slide_but_runs_them_all() {
        let root = tempfile::tempdir().unwrap();
        for s in ["S1", "S2"] {
            touch(&root.path().join("raw").join(s).join("t.rcpnl"));
        }
        let a = args(&[
            "--input",
            root.path().join("raw").to_str().unwrap(),
            "--output",
            root.path().join("out").to_str().unwrap(),
            "--ashlar",
            "false",
            "--threads",
            "2",
        ]);
        let jobs = plan(&a).unwrap();
        assert!(matches!(
            run_job(&jobs[0], &a),
            Err(Error::ExternalTool { code: 1, .. })
        ));
        assert!(matches!(run(a, |_, _| {}), Err(Error::Batch { failed: 2, total: 2, .. })));
    }

    #[test]
    fn failing_tool_fails_the_batch() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("raw").join("S1").join("t.rcpnl"));
        let a = args(&[
            "--input",
            root.path().join("raw").to_str().unwrap(),
            "--output",
            root.path().join("out").to_str().unwrap(),
            "--ashlar",
            "/nonexistent/ashlar-binary",
        ]);
        assert!(matches!(run(a, |_, _| {}), Err(Error::Batch { failed: 1, total: 1, .. })));
    }
}
