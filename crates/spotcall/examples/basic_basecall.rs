use spotcall::{read_measurement_csv, run_basecalling, BasisMatrix, PhaseConfig, PhaseParams, UnmixConfig};
use std::error::Error;
use std::path::Path;

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <basecaller_spot_data.csv> <basis.json> [p q]",
            args[0]
        );
        std::process::exit(2);
    }

    let table = read_measurement_csv(Path::new(&args[1]))?;
    let basis = BasisMatrix::from_json_file(Path::new(&args[2]), 1e6)?;
    let mut phase = PhaseConfig::default();
    if let (Some(p), Some(q)) = (args.get(3), args.get(4)) {
        phase.params = PhaseParams::new(p.parse()?, q.parse()?, 0.0);
    }

    let result = run_basecalling(&table, &basis, &UnmixConfig::default(), &phase)?;
    println!(
        "Called {} spots over {} cycles ({} indeterminate post-phase).",
        result.spots.len(),
        result.n_cycles,
        result.n_indeterminate(true)
    );
    for &spot in &result.spots {
        println!(
            "{}  {}  {}",
            spot,
            result.sequence(spot, false),
            result.sequence(spot, true)
        );
    }
    Ok(())
}
