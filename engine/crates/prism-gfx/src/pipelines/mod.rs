pub mod compute_pipeline;
