use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ipp::ipp::{CoordProjection, Ipp};
use ipp::pwaln::Coords;
use log::info;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::num::NonZeroUsize;

/// Command-line tool for projecting genomic coordinates between species
/// through a graph of pairwise whole-genome alignments.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the binary pwaln file.
    #[clap(short = 'p', long, value_parser)]
    pwalns: String,

    /// Directory containing one `<species>.sizes` file per species.
    #[clap(short = 'g', long, value_parser)]
    genome_sizes: String,

    /// Reference species the input coordinates belong to.
    #[clap(short = 'r', long, value_parser)]
    ref_species: String,

    /// Query species to project onto.
    #[clap(short = 'q', long, value_parser)]
    qry_species: String,

    /// Single coordinate in the format `chrom:loc`.
    #[clap(short = 'c', long, value_parser)]
    coord: Option<String>,

    /// Path to a TSV file with one `chrom<TAB>loc` coordinate per line.
    #[clap(short = 'b', long, value_parser)]
    coord_file: Option<String>,

    /// Reference-species distance (bp) at which the projection score is 0.5.
    #[clap(short = 'd', long, value_parser, default_value_t = 10_000)]
    half_life_distance: u32,

    /// Number of threads for parallel processing.
    #[clap(short = 't', long, value_parser, default_value_t = NonZeroUsize::new(1).unwrap())]
    num_threads: NonZeroUsize,
}

fn main() -> io::Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    let args = Args::parse();

    let mut engine = Ipp::new();
    engine.load_pwalns(&args.pwalns).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to load pwalns: {}", e),
        )
    })?;
    engine.load_genome_sizes(&args.genome_sizes).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to load genome sizes: {}", e),
        )
    })?;
    engine
        .set_half_life_distance(args.half_life_distance)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    info!("species in the pwaln graph: {}", engine.species().join(", "));

    let ref_coords = match (&args.coord, &args.coord_file) {
        (Some(coord), None) => vec![parse_coord(&engine, coord)?],
        (None, Some(coord_file)) => parse_coord_file(&engine, coord_file)?,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Either a single coordinate or a coordinate file must be provided",
            ))
        }
    };

    // Show a progress bar for bulk projections at info level (not at
    // error-only or debug level).
    let pb = if ref_coords.len() > 1
        && log::log_enabled!(log::Level::Info)
        && !log::log_enabled!(log::Level::Debug)
    {
        let progress_bar = ProgressBar::new(ref_coords.len() as u64);
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
                .unwrap()
                .progress_chars("#>-"),
        );
        Some(progress_bar)
    } else {
        None
    };

    // Callbacks are serialized by the worker pool but unordered; collect
    // and print in input order afterwards.
    let mut results: FxHashMap<Coords, CoordProjection> = FxHashMap::default();
    engine
        .project_coords(
            &args.ref_species,
            &args.qry_species,
            &ref_coords,
            args.num_threads,
            |ref_coord, projection| {
                if let Some(pb) = &pb {
                    pb.inc(1);
                }
                results.insert(ref_coord, projection);
            },
        )
        .map_err(|e| io::Error::other(format!("Projection failed: {}", e)))?;
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    for coord in &ref_coords {
        output_projection(&engine, &args.qry_species, *coord, &results[coord]);
    }
    Ok(())
}

fn parse_coord(engine: &Ipp, coord: &str) -> io::Result<Coords> {
    let (chrom_name, loc) = coord.split_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "Coordinate format should be `chrom:loc`",
        )
    })?;
    let chrom = engine
        .chrom_id_from_name(chrom_name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let loc = loc
        .parse::<u32>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid location value"))?;
    Ok(Coords { chrom, loc })
}

fn parse_coord_file(engine: &Ipp, coord_file: &str) -> io::Result<Vec<Coords>> {
    let file = File::open(coord_file)?;
    let reader = BufReader::new(file);
    let mut coords = Vec::new();

    for line in reader.lines() {
        let line = line?;
        let (chrom_name, rest) = line.split_once('\t').ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid coordinate file format",
            )
        })?;
        let chrom = engine
            .chrom_id_from_name(chrom_name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let loc = rest
            .split('\t')
            .next()
            .unwrap_or("")
            .parse::<u32>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid location value"))?;
        coords.push(Coords { chrom, loc });
    }

    Ok(coords)
}

fn output_projection(engine: &Ipp, qry_species: &str, coord: Coords, projection: &CoordProjection) {
    let ref_chrom = engine.chrom_name(coord.chrom).unwrap_or("?");

    match projection.node(qry_species) {
        Some(node) => {
            let qry_chrom = engine.chrom_name(node.coords.chrom).unwrap_or("?");
            let path = projection
                .path_to(qry_species)
                .map(|path| path.join("->"))
                .unwrap_or_else(|| ".".to_string());
            let direct = projection
                .direct
                .as_ref()
                .map(|d| d.score.to_string())
                .unwrap_or_else(|| ".".to_string());
            println!(
                "{}:{}\t{}:{}\t{}\t{}\t{}",
                ref_chrom, coord.loc, qry_chrom, node.coords.loc, node.score, path, direct
            );
        }
        None => {
            println!("{}:{}\t.\t0\t.\t.", ref_chrom, coord.loc);
        }
    }
}
