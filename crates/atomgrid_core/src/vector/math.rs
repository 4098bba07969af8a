//! Dense `f32` vector helpers shared by basis construction, projection and
//! refinement.

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn l2_norm(values: &[f32]) -> f32 {
    dot(values, values).sqrt()
}

/// Cosine similarity; `0.0` when either side has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let denom = l2_norm(a) * l2_norm(b);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    (dot(a, b) / denom).clamp(-1.0, 1.0)
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Returns a unit-length copy, or `None` for zero-magnitude input.
pub fn normalized(values: &[f32]) -> Option<Vec<f32>> {
    let norm = l2_norm(values);
    if norm <= f32::EPSILON {
        return None;
    }
    Some(values.iter().map(|value| value / norm).collect())
}

/// `target -= coefficient * direction`
pub fn axpy_sub(target: &mut [f32], coefficient: f32, direction: &[f32]) {
    for (slot, value) in target.iter_mut().zip(direction) {
        *slot -= coefficient * value;
    }
}

/// Pearson correlation of two equally long series; `0.0` when degenerate.
pub fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = xs[..n].iter().sum::<f64>() / n as f64;
    let mean_y = ys[..n].iter().sum::<f64>() / n as f64;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in xs[..n].iter().zip(&ys[..n]) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}
