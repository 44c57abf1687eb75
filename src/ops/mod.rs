// Operation enums and trait implementations
pub mod binary;
pub mod matmul;
pub mod movement;
pub mod reduce;
pub mod unary;

pub use binary::{BinaryGradFn, BinaryOp};
pub use matmul::MatMulGradFn;
pub use movement::{ConcatGradFn, MovementGradFn, MovementOp};
pub use reduce::{MaxDimGradFn, SumDimGradFn, SumGradFn};
pub use unary::{UnaryGradFn, UnaryOp};
