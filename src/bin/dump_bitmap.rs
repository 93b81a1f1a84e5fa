use anyhow::Result;
use std::env;
use std::path::Path;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use bitmap_alloc::*;

//-------------------------------------------------------------------------

fn dump<P: AsRef<Path>>(p: P) -> Result<()> {
    let storage = FileStorageBuilder::open(p).build()?;
    let alloc = Allocator::create(Arc::new(storage))?;

    println!(
        "elements: {}, allocated: {}, free: {}",
        alloc.capacity(),
        alloc.allocated(),
        alloc.available()
    );
    for (offset, len) in alloc.allocated_regions() {
        println!("    {}..{} ({})", offset, offset + len, len);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let verbose = args.iter().skip(1).filter(|a| *a == "-v").count();
    let paths: Vec<&String> = args.iter().skip(1).filter(|a| *a != "-v").collect();

    if paths.len() != 1 {
        eprintln!("Usage: {} [-v] <path_to_bitmap>", args[0]);
        std::process::exit(1);
    }

    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = dump(paths[0]) {
        eprintln!("Error dumping bitmap: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

//-------------------------------------------------------------------------
