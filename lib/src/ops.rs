//! Forward and input-gradient kernels for the layers of a feature extractor.
//!
//! Every kernel writes whole output planes, so the planes can be handed out to
//! worker threads without any synchronization and the result does not depend
//! on the number of threads.

use crate::{
    backbone::{Activation, Conv2d, Pool},
    tensor::{FeatureMap, Shape},
};

pub(crate) fn conv_output_shape(conv: &Conv2d, input: Shape) -> Option<Shape> {
    let span = |len: usize| {
        let padded = len + 2 * conv.padding;
        if padded < conv.kernel_size {
            None
        } else {
            Some((padded - conv.kernel_size) / conv.stride + 1)
        }
    };

    Some(Shape::new(
        span(input.height)?,
        span(input.width)?,
        conv.out_channels,
    ))
}

pub(crate) fn pool_output_shape(pool: Pool, input: Shape) -> Option<Shape> {
    if input.height < pool.window || input.width < pool.window {
        return None;
    }

    Some(Shape::new(
        (input.height - pool.window) / pool.stride + 1,
        (input.width - pool.window) / pool.stride + 1,
        input.channels,
    ))
}

/// Runs `f(plane_index, plane)` over every `plane_len` chunk of `out`,
/// spreading the planes over at most `threads` scoped workers
fn for_each_plane<F>(out: &mut [f64], plane_len: usize, threads: usize, f: F)
where
    F: Fn(usize, &mut [f64]) + Sync,
{
    let planes = out.len() / plane_len;
    let threads = threads.min(planes).max(1);

    // for WASM we do not have threads and crossbeam panics
    #[cfg(target_arch = "wasm32")]
    let threads = 1;

    if threads == 1 {
        for (i, plane) in out.chunks_mut(plane_len).enumerate() {
            f(i, plane);
        }
        return;
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        let per_worker = (planes + threads - 1) / threads;
        let f = &f;

        crossbeam_utils::thread::scope(|scope| {
            for (w, chunk) in out.chunks_mut(per_worker * plane_len).enumerate() {
                scope.spawn(move |_| {
                    for (i, plane) in chunk.chunks_mut(plane_len).enumerate() {
                        f(w * per_worker + i, plane);
                    }
                });
            }
        })
        .unwrap();
    }
}

/// Index range of output positions `o` for which `o * stride + k - padding`
/// falls inside `0..input_len`
#[inline]
fn valid_range(
    k: usize,
    padding: usize,
    stride: usize,
    input_len: usize,
    output_len: usize,
) -> (usize, usize) {
    // o * stride + k >= padding
    let start = if k >= padding {
        0
    } else {
        (padding - k + stride - 1) / stride
    };

    // o * stride + k < input_len + padding
    let limit = input_len + padding;
    let end = if k >= limit {
        0
    } else {
        ((limit - k + stride - 1) / stride).min(output_len)
    };

    (start, end.max(start))
}

/// Convolution followed by the fused activation
pub(crate) fn conv_forward(
    conv: &Conv2d,
    input: &FeatureMap,
    out_shape: Shape,
    threads: usize,
) -> FeatureMap {
    let in_shape = input.shape();
    let mut out = FeatureMap::zeros(out_shape);
    let k = conv.kernel_size;
    let (s, p) = (conv.stride, conv.padding);

    for_each_plane(out.as_mut_slice(), out_shape.plane_len(), threads, |o, plane| {
        for v in plane.iter_mut() {
            *v = conv.biases[o];
        }

        for i in 0..conv.in_channels {
            let src = input.plane(i);

            for ky in 0..k {
                let (y0, y1) = valid_range(ky, p, s, in_shape.height, out_shape.height);

                for kx in 0..k {
                    let w = conv.weight(o, i, ky, kx);
                    if w == 0.0 {
                        continue;
                    }

                    let (x0, x1) = valid_range(kx, p, s, in_shape.width, out_shape.width);

                    for y in y0..y1 {
                        let iy = y * s + ky - p;
                        let src_row = &src[iy * in_shape.width..(iy + 1) * in_shape.width];
                        let dst_row = &mut plane[y * out_shape.width..(y + 1) * out_shape.width];

                        for x in x0..x1 {
                            dst_row[x] += w * src_row[x * s + kx - p];
                        }
                    }
                }
            }
        }

        if conv.activation == Activation::Relu {
            for v in plane.iter_mut() {
                if *v < 0.0 {
                    *v = 0.0;
                }
            }
        }
    });

    out
}

/// Gradient of a convolution w.r.t. its input, given the gradient w.r.t. its
/// activated output and the activated output itself
pub(crate) fn conv_backward(
    conv: &Conv2d,
    in_shape: Shape,
    output: &FeatureMap,
    grad_output: &FeatureMap,
    threads: usize,
) -> FeatureMap {
    let out_shape = output.shape();

    // Zero the gradient wherever the ReLU was inactive
    let masked;
    let grad_output = match conv.activation {
        Activation::Relu => {
            let mut g = grad_output.clone();
            for (g, o) in g.as_mut_slice().iter_mut().zip(output.as_slice()) {
                if *o <= 0.0 {
                    *g = 0.0;
                }
            }
            masked = g;
            &masked
        }
        Activation::Linear => grad_output,
    };

    let mut grad_input = FeatureMap::zeros(in_shape);
    let k = conv.kernel_size;
    let (s, p) = (conv.stride, conv.padding);

    for_each_plane(grad_input.as_mut_slice(), in_shape.plane_len(), threads, |i, plane| {
        for o in 0..conv.out_channels {
            let g = grad_output.plane(o);

            for ky in 0..k {
                let (y0, y1) = valid_range(ky, p, s, in_shape.height, out_shape.height);

                for kx in 0..k {
                    let w = conv.weight(o, i, ky, kx);
                    if w == 0.0 {
                        continue;
                    }

                    let (x0, x1) = valid_range(kx, p, s, in_shape.width, out_shape.width);

                    for y in y0..y1 {
                        let iy = y * s + ky - p;
                        let g_row = &g[y * out_shape.width..(y + 1) * out_shape.width];
                        let dst_row = &mut plane[iy * in_shape.width..(iy + 1) * in_shape.width];

                        for x in x0..x1 {
                            dst_row[x * s + kx - p] += w * g_row[x];
                        }
                    }
                }
            }
        }
    });

    grad_input
}

pub(crate) fn avg_pool_forward(
    pool: Pool,
    input: &FeatureMap,
    out_shape: Shape,
    threads: usize,
) -> FeatureMap {
    let in_shape = input.shape();
    let mut out = FeatureMap::zeros(out_shape);
    let scale = 1.0 / (pool.window * pool.window) as f64;

    for_each_plane(out.as_mut_slice(), out_shape.plane_len(), threads, |c, plane| {
        let src = input.plane(c);

        for y in 0..out_shape.height {
            for x in 0..out_shape.width {
                let mut sum = 0.0;
                for dy in 0..pool.window {
                    let row = (y * pool.stride + dy) * in_shape.width;
                    for dx in 0..pool.window {
                        sum += src[row + x * pool.stride + dx];
                    }
                }
                plane[y * out_shape.width + x] = sum * scale;
            }
        }
    });

    out
}

/// Spreads every output gradient evenly over the window it was averaged from
pub(crate) fn avg_pool_backward(
    pool: Pool,
    in_shape: Shape,
    grad_output: &FeatureMap,
    threads: usize,
) -> FeatureMap {
    let out_shape = grad_output.shape();
    let mut grad_input = FeatureMap::zeros(in_shape);
    let scale = 1.0 / (pool.window * pool.window) as f64;

    for_each_plane(grad_input.as_mut_slice(), in_shape.plane_len(), threads, |c, plane| {
        let g = grad_output.plane(c);

        for y in 0..out_shape.height {
            for x in 0..out_shape.width {
                let share = g[y * out_shape.width + x] * scale;
                for dy in 0..pool.window {
                    let row = (y * pool.stride + dy) * in_shape.width;
                    for dx in 0..pool.window {
                        plane[row + x * pool.stride + dx] += share;
                    }
                }
            }
        }
    });

    grad_input
}
