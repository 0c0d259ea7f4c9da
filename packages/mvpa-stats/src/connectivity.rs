//! Connected-component labelling over row-major boolean grids.
//!
//! Two samples are neighbours when they differ by one step along a single
//! axis: plain adjacency on a time course, 4-connectivity (shared edge, no
//! diagonals) on a time×time matrix.

/// Row-major strides for `shape`
fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Multi-index of a row-major flat index
pub fn unravel(flat: usize, shape: &[usize]) -> Vec<usize> {
    strides(shape)
        .iter()
        .zip(shape)
        .map(|(&stride, &len)| (flat / stride) % len)
        .collect()
}

/// Label the `true` regions of a flattened grid.
///
/// Each component is returned as its ascending flat indices; components are
/// ordered by their first flat index.
pub fn label_components(mask: &[bool], shape: &[usize]) -> Vec<Vec<usize>> {
    let n: usize = shape.iter().product();
    debug_assert_eq!(mask.len(), n);

    let strides = strides(shape);
    let mut visited = vec![false; n];
    let mut components = Vec::new();
    let mut stack = Vec::new();

    for seed in 0..n {
        if !mask[seed] || visited[seed] {
            continue;
        }
        visited[seed] = true;
        stack.push(seed);
        let mut members = Vec::new();

        while let Some(idx) = stack.pop() {
            members.push(idx);
            for (axis, &stride) in strides.iter().enumerate() {
                let coord = (idx / stride) % shape[axis];
                if coord > 0 {
                    let nb = idx - stride;
                    if mask[nb] && !visited[nb] {
                        visited[nb] = true;
                        stack.push(nb);
                    }
                }
                if coord + 1 < shape[axis] {
                    let nb = idx + stride;
                    if mask[nb] && !visited[nb] {
                        visited[nb] = true;
                        stack.push(nb);
                    }
                }
            }
        }

        members.sort_unstable();
        components.push(members);
    }

    components
}
