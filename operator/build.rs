use kube::CustomResourceExt;
use mongo_operator_types::*;
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/storage.mongodb.example.com_mongoclusters_crd.yaml",
        serde_yaml::to_string(&MongoCluster::crd()).unwrap(),
    )
    .unwrap();
}
