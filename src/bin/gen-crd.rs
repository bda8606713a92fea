use kube::CustomResourceExt;
use vaaka::crd::experiment::Experiment;

fn main() -> anyhow::Result<()> {
    // JSON output; pipe through a YAML converter for manifests
    let crd = serde_json::to_string_pretty(&Experiment::crd())?;
    println!("{}", crd);
    Ok(())
}
