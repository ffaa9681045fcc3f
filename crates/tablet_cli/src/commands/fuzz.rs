//! Fuzz command implementation.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tablet_testkit::{
    dump_test_case, generate_test_case, int_schema, pk_only_schema, run_fuzz_case, FuzzReport,
    OpSet, DEFAULT_KEYSPACE,
};
use tracing::{error, info};

/// Runs `runs` seeded cases, stopping at the first failure.
pub fn run(
    seed: u64,
    runs: u64,
    len: usize,
    pk_only: bool,
    update_multiplier: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let set = if pk_only { OpSet::PkOnly } else { OpSet::All };
    let mut total = FuzzReport::default();

    for seed in seed..seed.saturating_add(runs) {
        let mut rng = StdRng::seed_from_u64(seed);
        let case = generate_test_case(&mut rng, len, set, DEFAULT_KEYSPACE);
        let schema = if pk_only { pk_only_schema() } else { int_schema() };
        match run_fuzz_case(schema, &case, update_multiplier) {
            Ok(report) => {
                info!(seed, steps = report.steps, "case passed");
                total.steps += report.steps;
                total.batches += report.batches;
                total.flushes += report.flushes;
                total.compactions += report.compactions;
                total.restarts += report.restarts;
                total.snapshots_checked += report.snapshots_checked;
                total.snapshots_too_old += report.snapshots_too_old;
            }
            Err(err) => {
                error!(seed, %err, "case failed");
                println!("{}", dump_test_case(&case));
                return Err(format!("seed {seed} failed: {err}").into());
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&total)?);
    Ok(())
}
