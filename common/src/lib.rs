pub mod shutdown;

/// Writes the readiness marker the container's readiness probe checks for.
pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

/// Annotation keys stamped on every child resource the operator manages.
pub mod annotations {
    pub const CREATED_BY: &str = "mongodb.example.com/created-by";
    pub const SPEC_HASH: &str = "mongodb.example.com/spec-hash";
}

/// Label keys stamped on every child resource, associating it back to its
/// owning `MongoCluster`.
pub mod labels {
    pub const OPERATED_BY: &str = "operated-by";
    pub const HERITAGE: &str = "heritage";
    pub const NAME: &str = "name";
    pub const APP: &str = "app";
}
