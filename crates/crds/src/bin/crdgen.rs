//! Prints the ClusterCIDR CustomResourceDefinition as YAML.

use crds::ClusterCIDR;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&ClusterCIDR::crd())?);
    Ok(())
}
