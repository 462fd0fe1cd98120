use kanari::crd::canary::Canary;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    // cargo run --bin gen-crd > canary-crd.json && kubectl apply -f canary-crd.json
    let crd = serde_json::to_string_pretty(&Canary::crd())?;
    println!("{crd}");
    Ok(())
}
