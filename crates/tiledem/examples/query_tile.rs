//! Example: composite the tile containing a point and report its heights.
//!
//! Usage: cargo run --example query_tile -- <lon> <lat> [primary]

use std::env;
use std::time::Instant;
use tiledem::{lonlat_to_tile, CompositeEngine, FetchPolicy, HttpTileFetcher, SourceCatalog, DEFAULT_TILE_SIDE};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: {} <lon> <lat> [primary]", args[0]);
        eprintln!("Example: {} 138.7274 35.3606 qmap_dem", args[0]);
        std::process::exit(1);
    }

    let lon: f64 = args[1].parse().expect("Invalid longitude");
    let lat: f64 = args[2].parse().expect("Invalid latitude");
    let primary = args.get(3).map(|s| s.as_str()).unwrap_or("qmap_dem");

    let catalog = SourceCatalog::builtin();
    let zoom = catalog.output_zoom(primary, None).expect("Unknown primary source");
    let tile = lonlat_to_tile(lon, lat, zoom);
    println!("Tile {} for ({}, {})", tile, lon, lat);

    let fetcher = HttpTileFetcher::new(FetchPolicy::default(), DEFAULT_TILE_SIDE).expect("Failed to build client");
    let engine = CompositeEngine::new(&catalog, &fetcher, DEFAULT_TILE_SIDE);

    let start = Instant::now();
    let result = engine.composite(tile, primary).expect("Composite failed");
    let stats = fetcher.download_stats();
    println!(
        "{} responses, {} bytes in {:.2}s",
        stats.responses,
        stats.bytes_downloaded,
        start.elapsed().as_secs_f64()
    );

    match &result.heights {
        Some(heights) => {
            println!("Sources: {}", result.provenance.join(", "));
            println!("Valid:   {:.1}%", heights.valid_fraction() * 100.0);
            if let Some((lo, hi)) = heights.min_max() {
                println!("Range:   {:.2} .. {:.2} m", lo, hi);
            }
        }
        None => println!("No source has data for this tile"),
    }
}
