use std::path::Path;

use crate::cmd::{compose_runtime, load_config, system_exec};

pub fn run(root: &Path, lines: u32) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let runtime = compose_runtime(root, &config, system_exec());
    let output = runtime.logs(lines)?;
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
