//! Separable box smoothing of 3D volumes
//!
//! A running-sum box filter is applied along X, Y and Z in turn. Near the
//! volume border the window shrinks to the samples that exist, so the
//! filter never reads outside the array and constant regions stay constant.

use std::collections::VecDeque;

use crate::volume::idx3d;

/// 1D box filter on a line (in-place)
///
/// Uses a running sum; the first and last `boxsize/2` samples average over
/// the shrunken window. Lines shorter than the box are left unchanged.
pub fn box_filter_line(line: &mut [f64], boxsize: usize) {
    if boxsize < 3 || line.len() < boxsize {
        return;
    }

    let n = line.len();
    let r = boxsize / 2;

    let mut queue: VecDeque<f64> = VecDeque::with_capacity(boxsize);

    let mut lsum: f64 = line[..r].iter().sum();
    for &v in &line[..r] {
        queue.push_back(v);
    }

    // Growing window at the start
    for i in 0..=r {
        lsum += line[i + r];
        queue.push_back(line[i + r]);
        line[i] = lsum / (r + i + 1) as f64;
    }

    // Full window
    for i in (r + 1)..(n - r) {
        let old = queue.pop_front().unwrap_or(0.0);
        lsum += line[i + r] - old;
        queue.push_back(line[i + r]);
        line[i] = lsum / boxsize as f64;
    }

    // Shrinking window at the end
    for i in (n - r)..n {
        let old = queue.pop_front().unwrap_or(0.0);
        lsum -= old;
        line[i] = lsum / (r + n - i) as f64;
    }
}

/// Smooth a 3D volume with an isotropic box of odd width `boxsize`
///
/// `boxsize` of 3 gives the usual 3x3x3 neighbourhood average. Axes with a
/// single sample are skipped.
pub fn box_smooth_3d(
    data: &[f64],
    nx: usize, ny: usize, nz: usize,
    boxsize: usize,
) -> Vec<f64> {
    let mut result = data.to_vec();
    if boxsize < 3 {
        return result;
    }

    // X direction
    if nx > 1 {
        let mut line = vec![0.0; nx];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    line[i] = result[idx3d(i, j, k, nx, ny)];
                }
                box_filter_line(&mut line, boxsize);
                for i in 0..nx {
                    result[idx3d(i, j, k, nx, ny)] = line[i];
                }
            }
        }
    }

    // Y direction
    if ny > 1 {
        let mut line = vec![0.0; ny];
        for k in 0..nz {
            for i in 0..nx {
                for j in 0..ny {
                    line[j] = result[idx3d(i, j, k, nx, ny)];
                }
                box_filter_line(&mut line, boxsize);
                for j in 0..ny {
                    result[idx3d(i, j, k, nx, ny)] = line[j];
                }
            }
        }
    }

    // Z direction
    if nz > 1 {
        let mut line = vec![0.0; nz];
        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    line[k] = result[idx3d(i, j, k, nx, ny)];
                }
                box_filter_line(&mut line, boxsize);
                for k in 0..nz {
                    result[idx3d(i, j, k, nx, ny)] = line[k];
                }
            }
        }
    }

    result
}
