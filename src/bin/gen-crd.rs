use kanary::crd::experiment::Experiment;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    // Pipe through `yq -P` for YAML
    let crd = serde_json::to_string_pretty(&Experiment::crd())?;
    println!("{}", crd);
    Ok(())
}
