pub mod batch;

// Re-export for convenience
pub use batch::BatchDriver;
