//! gampoi_transform command-line interface

use std::fs::File;
use std::io::BufWriter;

use clap::Parser;
use log::{info, LevelFilter};

use gampoi_transform::cli::{Cli, Commands, DeltaArgs, InputArgs, ResidualArgs};
use gampoi_transform::prelude::*;

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let result = match &cli.command {
        Commands::Acosh(args) => run_delta(DeltaFamily::Acosh, args),
        Commands::ShiftedLog(args) => run_delta(DeltaFamily::ShiftedLog, args),
        Commands::Residuals(args) => run_residuals(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Open the count file as a block-backed matrix
fn open_blocked(args: &InputArgs) -> Result<(Counts, Vec<String>, Vec<String>)> {
    let store = DelimitedBlockFile::open(&args.counts, &args.block())?;
    let gene_ids = store.gene_ids().to_vec();
    let sample_ids = store.sample_ids().to_vec();
    let (counts, _) = normalize(InputData::Blocked(BlockedCounts::new(store)))?;
    Ok((counts, gene_ids, sample_ids))
}

fn run_delta(family: DeltaFamily, args: &DeltaArgs) -> Result<()> {
    let params = args.params()?;
    let fitter = IrlsFitter::default();

    if args.input.streaming {
        info!("Streaming {} in blocks of {} genes", args.input.counts.display(), args.input.block_rows);
        let (counts, gene_ids, sample_ids) = open_blocked(&args.input)?;
        let mut writer = DelimitedBlockWriter::create(&args.input.output, gene_ids, &sample_ids)?;
        delta_transform_into(&counts, family, &params, None, &fitter, &mut writer)?;
        writer.finish()?;
    } else {
        let matrix = read_count_matrix(&args.input.counts)?;
        let (input, gene_ids, sample_ids) = matrix.into_parts();
        let transformed = match family {
            DeltaFamily::Acosh => acosh_transform_with(input, &params, None, &fitter)?,
            DeltaFamily::ShiftedLog => shifted_log_transform_with(input, &params, None, &fitter)?,
        };
        write_transformed(&args.input.output, &gene_ids, &sample_ids, &transformed)?;
    }

    info!("Wrote {}", args.input.output.display());
    Ok(())
}

fn load_design(args: &ResidualArgs, sample_ids: &[String]) -> Result<Option<DesignMatrix>> {
    let (Some(path), Some(variable)) = (&args.metadata, &args.design) else {
        return Ok(None);
    };
    info!("Loading metadata from {}", path.display());
    let metadata = read_metadata(path)?.align_to(sample_ids)?;
    let design = DesignMatrix::from_factor(&metadata, variable)?;
    info!("Design columns: {}", design.column_names().join(", "));
    Ok(Some(design))
}

fn run_residuals(args: &ResidualArgs) -> Result<()> {
    // residual kind and flags are validated before any file is read
    args.params(None)?;
    let streams = SeededStreams::new(args.seed);
    let fitter = IrlsFitter::default();

    let fit = if args.input.streaming {
        let (counts, gene_ids, sample_ids) = open_blocked(&args.input)?;
        let params = args.params(load_design(args, &sample_ids)?)?;
        let mut writer = DelimitedBlockWriter::create(&args.input.output, gene_ids, &sample_ids)?;
        let fit = residual_transform_into(&counts, &params, &streams, &fitter, &mut writer)?;
        writer.finish()?;
        fit
    } else {
        let matrix = read_count_matrix(&args.input.counts)?;
        let (input, gene_ids, sample_ids) = matrix.into_parts();
        let params = args.params(load_design(args, &sample_ids)?)?;
        let output = residual_transform_with(input, &params, &streams, &fitter)?;
        write_transformed(&args.input.output, &gene_ids, &sample_ids, &output.residuals)?;
        output.fit
    };
    info!("Wrote {}", args.input.output.display());

    if let (Some(path), Some(fit)) = (&args.fit_output, fit) {
        serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &fit)?;
        info!("Wrote fitted model to {}", path.display());
    }
    Ok(())
}
