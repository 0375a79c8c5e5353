//! End-to-end fixel statistics pipeline
//!
//! Sequences the full analysis: fixel indexing, fixel-fixel connectivity
//! from the tractogram, connectivity finalisation, subject loading with
//! along-tract smoothing, GLM population statistics, optional
//! non-stationarity pre-pass, permutation testing, and output writing. All
//! parameters are fixed at startup; any error aborts the run before
//! partial statistical output is committed.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Instant;

use clap::Parser;
use ndarray::Array2;
use rayon::prelude::*;

use crate::cfe::CfeEnhancer;
use crate::connectivity::{finalise, TrackProcessor};
use crate::fixel::FixelTable;
use crate::glm;
use crate::matrix;
use crate::msf_io::{read_msf_file, write_fixel_output};
use crate::permutation;
use crate::subjects::load_subject_data;
use crate::tracks::{TrackMapper, TrackReader};

/// Streamlines handed to the worker pool per loader batch
const TRACK_BATCH: usize = 10_000;

/// Statistical analysis of fixel-specific measures using connectivity-based
/// fixel enhancement and non-parametric permutation testing
#[derive(Parser, Debug, Clone)]
#[command(name = "fixelcfestats")]
pub struct StatsArgs {
    /// Text file listing the input fixel images, one per subject, relative
    /// to the list file's directory
    pub input: PathBuf,
    /// Fixel mask defining the fixels of interest
    pub template: PathBuf,
    /// Design matrix (whitespace-delimited text, one row per subject)
    pub design: PathBuf,
    /// Contrast matrix (whitespace-delimited text)
    pub contrast: PathBuf,
    /// Streamline file used to determine fixel-fixel connectivity
    pub tracks: PathBuf,
    /// Filename prefix for all output
    pub output: String,

    /// Skip permutation testing and only output population statistics
    /// (effect size, stdev etc)
    #[arg(long)]
    pub notest: bool,
    /// Number of permutations
    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u32).range(1..=100_000))]
    pub nperms: u32,
    /// Height increment used in the CFE integration
    #[arg(long, default_value_t = 0.1)]
    pub cfe_dh: f32,
    /// CFE extent exponent
    #[arg(long, default_value_t = 2.0)]
    pub cfe_e: f32,
    /// CFE height exponent
    #[arg(long, default_value_t = 1.0)]
    pub cfe_h: f32,
    /// CFE connectivity exponent
    #[arg(long, default_value_t = 0.1)]
    pub cfe_c: f32,
    /// Maximum angle (degrees) for inter-subject fixel correspondence and
    /// tangent matching
    #[arg(long, default_value_t = 30.0)]
    pub angle: f32,
    /// Fraction of shared connections required for the neighbourhood
    #[arg(long, default_value_t = 0.01)]
    pub connectivity: f32,
    /// FWHM (mm) of the Gaussian smoothing along the fibre tracts
    /// (0 disables smoothing)
    #[arg(long, default_value_t = 10.0)]
    pub smooth: f32,
    /// Adjust for non-stationarity
    #[arg(long)]
    pub nonstationary: bool,
    /// Number of permutations for the empirical statistic pre-pass
    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u32).range(1..=100_000))]
    pub nperms_nonstationary: u32,
    /// Master seed for the permutation RNG (random when omitted)
    #[arg(long)]
    pub seed: Option<u64>,
}

fn validate(args: &StatsArgs) -> Result<(), String> {
    if !(args.angle > 0.0 && args.angle <= 90.0) {
        return Err(format!("angle must lie in (0, 90], got {}", args.angle));
    }
    if !(args.connectivity > 0.0 && args.connectivity <= 1.0) {
        return Err(format!(
            "connectivity threshold must lie in (0, 1], got {}",
            args.connectivity
        ));
    }
    if args.cfe_dh <= 0.0 {
        return Err(format!("cfe_dh must be positive, got {}", args.cfe_dh));
    }
    if args.smooth < 0.0 {
        return Err(format!("smooth must be nonnegative, got {}", args.smooth));
    }
    Ok(())
}

/// Read the subject list: one image path per line, relative to the list
/// file's directory; every image must exist before any computation starts
fn read_subject_list(input: &Path) -> Result<Vec<PathBuf>, String> {
    let text = std::fs::read_to_string(input)
        .map_err(|e| format!("failed to read subject list '{}': {}", input.display(), e))?;
    let folder = input.parent().unwrap_or_else(|| Path::new(""));
    let mut filenames = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let path = folder.join(trimmed);
        if !path.exists() {
            return Err(format!("input fixel image not found: {}", path.display()));
        }
        filenames.push(path);
    }
    if filenames.is_empty() {
        return Err(format!("subject list '{}' is empty", input.display()));
    }
    Ok(filenames)
}

/// Zero-pad the contrast matrix out to the design's column count
fn pad_contrast(contrast: Array2<f64>, regressors: usize) -> Result<Array2<f64>, String> {
    if contrast.ncols() > regressors {
        return Err(format!(
            "too many contrast columns ({}) for the design matrix ({})",
            contrast.ncols(),
            regressors
        ));
    }
    if contrast.ncols() == regressors {
        return Ok(contrast);
    }
    let mut padded = Array2::<f64>::zeros((contrast.nrows(), regressors));
    for i in 0..contrast.nrows() {
        for j in 0..contrast.ncols() {
            padded[[i, j]] = contrast[[i, j]];
        }
    }
    Ok(padded)
}

/// Run the full pipeline
pub fn run(args: &StatsArgs) -> Result<(), String> {
    run_with_cancel(args, &AtomicBool::new(false))
}

/// Run the full pipeline with a cooperative cancellation flag
///
/// Raising the flag aborts the parallel phases; no statistical output is
/// written for a cancelled run.
pub fn run_with_cancel(args: &StatsArgs, cancel: &AtomicBool) -> Result<(), String> {
    validate(args)?;
    let total_start = Instant::now();

    println!("[STEP 1] Reading inputs...");
    let filenames = read_subject_list(&args.input)?;
    println!("[INFO] {} subjects listed", filenames.len());

    let design = matrix::load_matrix(&args.design)?;
    if design.nrows() != filenames.len() {
        return Err(format!(
            "number of subjects ({}) does not match the design matrix rows ({})",
            filenames.len(),
            design.nrows()
        ));
    }
    let contrast = pad_contrast(matrix::load_matrix(&args.contrast)?, design.ncols())?;

    let mask = read_msf_file(&args.template)?;
    let table = FixelTable::build(&mask);
    println!("[INFO] number of fixels: {}", table.num_fixels());

    println!("[STEP 2] Computing fixel-fixel connectivity...");
    let start = Instant::now();
    let mut reader = TrackReader::open(&args.tracks)?;
    let num_tracks = reader.count().unwrap_or(0);
    if num_tracks == 0 {
        return Err("no tracks found in input file".to_string());
    }
    if num_tracks < 1_000_000 {
        eprintln!(
            "[WARN] more than 1 million tracks should be used to ensure robust fixel-fixel connectivity (found {})",
            num_tracks
        );
    }

    let mapper = TrackMapper::new(&mask)?;
    let processor = TrackProcessor::new(&table, args.angle);
    let mut batch: Vec<Vec<[f32; 3]>> = Vec::with_capacity(TRACK_BATCH);
    let mut processed = 0usize;
    loop {
        batch.clear();
        while batch.len() < TRACK_BATCH {
            match reader.next_track()? {
                Some(track) => batch.push(track),
                None => break,
            }
        }
        if batch.is_empty() {
            break;
        }
        batch
            .par_iter()
            .for_each(|points| processor.process(&mapper.map_track(points)));
        processed += batch.len();
    }
    println!("[INFO] {} streamlines processed in {:.2?}", processed, start.elapsed());

    println!("[STEP 3] Normalising and thresholding the connectivity matrix...");
    let start = Instant::now();
    let (raw, tdi) = processor.finish();
    let (connectivity, smoothing) = finalise(
        raw,
        &tdi,
        &table.positions,
        args.connectivity,
        args.cfe_c,
        args.smooth,
    );
    println!("[INFO] connectivity finalised in {:.2?}", start.elapsed());

    println!("[STEP 4] Loading subject data...");
    let start = Instant::now();
    let data = load_subject_data(&filenames, &mask, &table, &smoothing, args.angle)?;
    println!("[INFO] {} subjects loaded in {:.2?}", data.ncols(), start.elapsed());

    println!("[STEP 5] Computing population statistics...");
    let betas = glm::solve_betas(&data, &design)?;
    for i in 0..contrast.ncols() {
        write_fixel_output(
            Path::new(&format!("{}_beta{}.msf", args.output, i)),
            &betas.column(i).to_vec(),
            &mask,
            &[],
        )?;
    }
    let abs_effect = glm::abs_effect_size(&data, &design, &contrast)?;
    write_fixel_output(
        Path::new(&format!("{}_abs_effect.msf", args.output)),
        &abs_effect.column(0).to_vec(),
        &mask,
        &[],
    )?;
    let std_effect = glm::std_effect_size(&data, &design, &contrast)?;
    write_fixel_output(
        Path::new(&format!("{}_std_effect.msf", args.output)),
        &std_effect.column(0).to_vec(),
        &mask,
        &[],
    )?;
    let sigma = glm::stdev(&data, &design)?;
    write_fixel_output(
        Path::new(&format!("{}_std_dev.msf", args.output)),
        &sigma,
        &mask,
        &[],
    )?;

    // Provenance recorded on every statistical output map
    let mut comments = vec![
        format!("num permutations = {}", args.nperms),
        format!("dh = {}", args.cfe_dh),
        format!("cfe_e = {}", args.cfe_e),
        format!("cfe_h = {}", args.cfe_h),
        format!("cfe_c = {}", args.cfe_c),
        format!("angular threshold = {}", args.angle),
        format!("connectivity threshold = {}", args.connectivity),
        format!("smoothing FWHM = {}", args.smooth),
        format!("nonstationary adjustment = {}", args.nonstationary),
    ];

    let glm_ttest = glm::GlmTTest::new(&data, &design, &contrast)?;
    let enhancer = CfeEnhancer::new(&connectivity, args.cfe_dh, args.cfe_e, args.cfe_h);
    let seed = args.seed.unwrap_or_else(rand::random);
    comments.push(format!("seed = {}", seed));

    let empirical = if args.nonstationary {
        println!("[STEP 6] Precomputing the empirical statistic for non-stationarity adjustment...");
        let start = Instant::now();
        // The empirical pre-pass draws from its own permutation stream
        let empirical_seed = seed.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let empirical = permutation::precompute_empirical_stat(
            &glm_ttest,
            &enhancer,
            args.nperms_nonstationary as usize,
            empirical_seed,
            cancel,
        )?;
        println!(
            "[INFO] {} empirical permutations in {:.2?}",
            args.nperms_nonstationary,
            start.elapsed()
        );
        write_fixel_output(
            Path::new(&format!("{}_cfe_empirical.msf", args.output)),
            &empirical,
            &mask,
            &comments,
        )?;
        Some(empirical)
    } else {
        None
    };

    if !args.notest {
        println!("[STEP 7] Permutation testing ({} permutations)...", args.nperms);
        let start = Instant::now();
        let result = permutation::run(
            &glm_ttest,
            &enhancer,
            args.nperms as usize,
            seed,
            empirical.as_deref(),
            cancel,
        )?;
        println!("[INFO] permutation testing completed in {:.2?}", start.elapsed());

        println!("[STEP 8] Writing final results...");
        matrix::save_vector(
            Path::new(&format!("{}_perm_dist_pos.txt", args.output)),
            &result.perm_dist_pos,
        )?;
        matrix::save_vector(
            Path::new(&format!("{}_perm_dist_neg.txt", args.output)),
            &result.perm_dist_neg,
        )?;
        write_fixel_output(
            Path::new(&format!("{}_cfe_pos.msf", args.output)),
            &result.cfe_pos,
            &mask,
            &comments,
        )?;
        write_fixel_output(
            Path::new(&format!("{}_cfe_neg.msf", args.output)),
            &result.cfe_neg,
            &mask,
            &comments,
        )?;
        write_fixel_output(
            Path::new(&format!("{}_tvalue.msf", args.output)),
            &result.tvalues,
            &mask,
            &comments,
        )?;
        write_fixel_output(
            Path::new(&format!("{}_pvalue_pos.msf", args.output)),
            &result.pvalue_pos,
            &mask,
            &comments,
        )?;
        write_fixel_output(
            Path::new(&format!("{}_pvalue_neg.msf", args.output)),
            &result.pvalue_neg,
            &mask,
            &comments,
        )?;
    }

    println!("[INFO] Finished in {:.2?}", total_start.elapsed());
    Ok(())
}
