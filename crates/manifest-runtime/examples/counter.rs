//! Compile a small manifest and drive a counter up to its guard.
//!
//! ```text
//! RUST_LOG=manifest_runtime=debug cargo run -p manifest-runtime --example counter
//! ```

use anyhow::{bail, Context as _};
use manifest_compiler::compile_to_ir;
use manifest_runtime::prelude::*;
use serde_json::json;
use tracing_subscriber::EnvFilter;

const SOURCE: &str = r#"
entity Counter {
    property count: number = 0
    versionProperty version

    command increment(by: number = 1) emits Incremented {
        guard self.count + by <= 5
        mutate self.count = self.count + by
    }
}

event Incremented: "counters" { instanceId: string }
"#;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let output = compile_to_ir(SOURCE);
    for diagnostic in &output.diagnostics {
        eprintln!("{diagnostic}");
    }
    if output.has_errors() {
        bail!("manifest failed to compile");
    }
    let ir = output.ir.context("compiler returned no IR")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        let (engine, provenance) =
            RuntimeEngine::create(ir, RuntimeContext::default(), RuntimeOptions::default())?;
        println!("IR hash {} (valid: {})", provenance.computed_hash, provenance.valid);

        engine.subscribe(|event| {
            println!("  event {} on '{}': {}", event.name, event.channel, event.payload);
            Ok(())
        });
        engine.create_instance("Counter", json!({ "id": "c1" })).await?;

        for by in [2, 2, 2] {
            let result = engine
                .run_command("increment", json!({ "by": by }), RunOptions::on("Counter", "c1"))
                .await?;
            match result.error {
                None => println!("increment by {by} -> {}", result.result.unwrap_or_default()),
                Some(error) => println!("increment by {by} rejected: {error}"),
            }
        }

        if let Some(counter) = engine.get_instance("Counter", "c1").await? {
            println!("final: {}", counter.to_json());
        }
        Ok::<_, anyhow::Error>(())
    })
}
