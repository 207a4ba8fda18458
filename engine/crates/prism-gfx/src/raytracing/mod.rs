pub mod acceleration;
pub mod blas;
pub mod tlas;
