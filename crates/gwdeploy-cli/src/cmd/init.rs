use anyhow::Context;
use gwdeploy_core::{config::Config, io, paths};
use std::path::Path;

const MIGRATIONS_README: &str = "\
Schema migrations for the gateway database.

Each `*.sql` file is one change. The file name without `.sql` is its
identifier; pending changes run in lexical order (e.g. `0001_init.sql`,
`0002_add_consumers.sql`). Applied identifiers are recorded in
`gwdeploy_schema_migrations` and never run again, so never rename or edit a
file once it has been deployed. Add a new one instead.
";

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing gwdeploy in: {}", root.display());

    for dir in [paths::STATE_DIR, paths::MIGRATIONS_DIR] {
        let p = root.join(dir);
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
    }

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::default()
            .save(root)
            .with_context(|| format!("failed to write {}", paths::CONFIG_FILE))?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    let readme = root.join(paths::MIGRATIONS_DIR).join("README.md");
    if io::write_if_missing(&readme, MIGRATIONS_README.as_bytes())? {
        println!("  created: {}/README.md", paths::MIGRATIONS_DIR);
    } else {
        println!("  exists:  {}/README.md", paths::MIGRATIONS_DIR);
    }

    println!("\nNext: edit {} and run `gwdeploy config validate`.", paths::CONFIG_FILE);
    Ok(())
}
