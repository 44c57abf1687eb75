use crate::tensor::{RawTensor, Tensor};
use std::cell::Cell;
use std::collections::HashSet;

// ===== GRADIENT FUNCTION TRAIT =====

/// Trait for gradient computation functions.
///
/// Each operation type implements this to define how gradients flow backward.
/// The `backward` method takes:
/// - `out_grad`: gradient of loss w.r.t. this operation's output
/// - `parents`: the input tensors to this operation
///
/// Returns: vector of gradients w.r.t. each parent (Some if `requires_grad`, None otherwise)
pub trait GradFn {
    /// Compute gradients for parent tensors given output gradient
    fn backward(&self, out_grad: &RawTensor, parents: &[Tensor]) -> Vec<Option<Tensor>>;
    /// Clone this gradient function (needed for Rc/RefCell)
    fn clone_box(&self) -> Box<dyn GradFn>;
}

// ===== GRAD MODE =====

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether operations currently record the computation graph.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(Cell::get)
}

/// Run `f` without recording any graph. Outputs never require grad.
pub fn no_grad<T>(f: impl FnOnce() -> T) -> T {
    let previous = GRAD_ENABLED.with(|g| g.replace(false));
    let out = f();
    GRAD_ENABLED.with(|g| g.set(previous));
    out
}

/// Helper used by every op: should the output of an op over these inputs track grad?
pub(crate) fn needs_grad(inputs: &[&Tensor]) -> bool {
    is_grad_enabled() && inputs.iter().any(|t| t.borrow().requires_grad)
}

/// Attach graph information to an op output.
pub(crate) fn record(out: &Tensor, parents: Vec<Tensor>, grad_fn: Box<dyn GradFn>) {
    let mut o = out.borrow_mut();
    o.requires_grad = true;
    o.parents = parents;
    o.grad_fn = Some(grad_fn);
}

// ===== BACKPROPAGATION =====

impl RawTensor {
    /// Run backpropagation starting from this tensor
    ///
    /// This implements reverse-mode automatic differentiation:
    /// 1. Initialize this tensor's gradient to 1 (assumes it's a scalar loss)
    /// 2. Traverse the computation graph backwards (topological sort via DFS)
    /// 3. For each node, call its `grad_fn` to compute parent gradients
    /// 4. Accumulate gradients in each parent tensor
    ///
    /// # Panics
    /// Calling on a tensor that doesn't need gradients
    pub fn backward(tensor_ref: &Tensor) {
        enum Action {
            Visit(Tensor),
            PostVisit(Tensor),
        }

        assert!(
            tensor_ref.borrow().requires_grad,
            "Called backward on a tensor that doesn't require grad"
        );
        {
            let mut tensor = tensor_ref.borrow_mut();
            if tensor.grad.is_none() {
                tensor.grad = Some(vec![1.0; tensor.data.len()]);
            }
        }

        // Post-order DFS with an explicit stack; diamond graphs need every
        // consumer processed before its producer.
        let mut topo_order = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![Action::Visit(tensor_ref.clone())];

        while let Some(action) = stack.pop() {
            match action {
                Action::Visit(t) => {
                    if !visited.insert(t.as_ptr()) {
                        continue;
                    }
                    stack.push(Action::PostVisit(t.clone()));
                    let parents = t.borrow().parents.clone();
                    for parent in parents {
                        stack.push(Action::Visit(parent));
                    }
                }
                Action::PostVisit(t) => topo_order.push(t),
            }
        }

        for tensor in topo_order.into_iter().rev() {
            let (grad_fn, parents, grad_data, shape) = {
                let t = tensor.borrow();
                (
                    t.grad_fn.as_ref().map(|gf| gf.clone_box()),
                    t.parents.clone(),
                    t.grad.clone(),
                    t.shape.clone(),
                )
            };
            let (Some(grad_fn), Some(grad_out_data)) = (grad_fn, grad_data) else {
                continue;
            };

            let grad_out = RawTensor {
                data: grad_out_data,
                shape,
                grad: None,
                requires_grad: false,
                grad_fn: None,
                parents: vec![],
            };

            let parent_grads = grad_fn.backward(&grad_out, &parents);

            for (parent_grad, parent_ref) in parent_grads.into_iter().zip(parents.iter()) {
                let Some(g) = parent_grad else { continue };
                let mut parent = parent_ref.borrow_mut();
                if !parent.requires_grad {
                    continue;
                }
                let contribution = g.borrow().data.clone();
                match parent.grad {
                    None => parent.grad = Some(contribution),
                    Some(ref mut existing) => {
                        assert_eq!(
                            existing.len(),
                            contribution.len(),
                            "Gradient size mismatch during accumulation"
                        );
                        for (a, b) in existing.iter_mut().zip(contribution) {
                            *a += b;
                        }
                    }
                }
            }
        }
    }
}
