use crate::network::model::Model;

/// Global L2 norm over every parameter gradient.
pub fn grad_norm<M: Model + ?Sized>(model: &M) -> f64 {
    model.named_parameters()
        .iter()
        .map(|(_, p)| p.grad.sum_of_squares())
        .sum::<f64>()
        .sqrt()
}

/// Rescales all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm<M: Model + ?Sized>(model: &mut M, max_norm: f64) -> f64 {
    let norm = grad_norm(model);
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for (_, p) in model.named_parameters_mut() {
            p.grad.scale(coef);
        }
    }
    norm
}
