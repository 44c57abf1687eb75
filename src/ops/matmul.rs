use crate::autograd::{GradFn, needs_grad, record};
use crate::{RawTensor, Tensor};

/// Gradient for 2D matmul: dA = dC·Bᵀ, dB = Aᵀ·dC
#[derive(Clone)]
pub struct MatMulGradFn {
    m: usize,
    k: usize,
    n: usize,
}

impl GradFn for MatMulGradFn {
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Vec<Option<Tensor>> {
        let a = parents[0].borrow();
        let b = parents[1].borrow();
        let (m, k, n) = (self.m, self.k, self.n);
        let g = &out_grad.data;

        let grad_a = a.requires_grad.then(|| {
            let mut da = vec![0.0; m * k];
            for i in 0..m {
                for j in 0..n {
                    let gij = g[i * n + j];
                    if gij == 0.0 {
                        continue;
                    }
                    for p in 0..k {
                        da[i * k + p] += gij * b.data[p * n + j];
                    }
                }
            }
            RawTensor::new(da, &[m, k], false)
        });

        let grad_b = b.requires_grad.then(|| {
            let mut db = vec![0.0; k * n];
            for i in 0..m {
                for p in 0..k {
                    let aip = a.data[i * k + p];
                    if aip == 0.0 {
                        continue;
                    }
                    for j in 0..n {
                        db[p * n + j] += aip * g[i * n + j];
                    }
                }
            }
            RawTensor::new(db, &[k, n], false)
        });

        vec![grad_a, grad_b]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

#[derive(Clone)]
struct TransposeGradFn {
    rows: usize,
    cols: usize,
}

impl GradFn for TransposeGradFn {
    fn backward(&self, out_grad: &RawTensor, _parents: &[Tensor]) -> Vec<Option<Tensor>> {
        // out_grad is [cols, rows]; transpose back to [rows, cols]
        let data = RawTensor::transpose_data(&out_grad.data, self.cols, self.rows);
        vec![Some(RawTensor::new(data, &[self.rows, self.cols], false))]
    }

    fn clone_box(&self) -> Box<dyn GradFn> {
        Box::new(self.clone())
    }
}

impl RawTensor {
    /// Matrix multiply `[m, k] x [k, n] -> [m, n]`
    pub fn matmul(self_t: &Tensor, other: &Tensor) -> Tensor {
        let (data, m, k, n) = {
            let a = self_t.borrow();
            let b = other.borrow();
            assert!(
                a.shape.len() == 2 && b.shape.len() == 2,
                "matmul expects 2D tensors, got {:?} and {:?}",
                a.shape,
                b.shape
            );
            let (m, k) = (a.shape[0], a.shape[1]);
            let n = b.shape[1];
            assert_eq!(k, b.shape[0], "matmul inner dimension mismatch");

            let mut out = vec![0.0; m * n];
            for i in 0..m {
                for p in 0..k {
                    let aip = a.data[i * k + p];
                    if aip == 0.0 {
                        continue;
                    }
                    let row = &b.data[p * n..(p + 1) * n];
                    for (o, &bv) in out[i * n..(i + 1) * n].iter_mut().zip(row) {
                        *o += aip * bv;
                    }
                }
            }
            (out, m, k, n)
        };

        let out = Self::new(data, &[m, n], false);
        if needs_grad(&[self_t, other]) {
            record(
                &out,
                vec![self_t.clone(), other.clone()],
                Box::new(MatMulGradFn { m, k, n }),
            );
        }
        out
    }

    fn transpose_data(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
        let mut out = vec![0.0; data.len()];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = data[r * cols + c];
            }
        }
        out
    }

    /// Transpose a 2D tensor
    pub fn transpose(self_t: &Tensor) -> Tensor {
        let (data, rows, cols) = {
            let s = self_t.borrow();
            assert_eq!(s.shape.len(), 2, "transpose expects a 2D tensor");
            let (rows, cols) = (s.shape[0], s.shape[1]);
            (Self::transpose_data(&s.data, rows, cols), rows, cols)
        };
        let out = Self::new(data, &[cols, rows], false);
        if needs_grad(&[self_t]) {
            record(
                &out,
                vec![self_t.clone()],
                Box::new(TransposeGradFn { rows, cols }),
            );
        }
        out
    }
}
