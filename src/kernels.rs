//! Per-cell math of every pipeline stage.
//!
//! These functions are what the CPU backend executes for each texel and what
//! `shaders/fluid.wgsl` mirrors on the GPU. Coordinates are normalized
//! texture coordinates with `v = 0` on the bottom row; sampling clamps to the
//! edge.

pub trait Sampler {
    fn sample(&self, uv: [f32; 2]) -> [f32; 4];
}

/// Bilinear tap of a `width` x `height` grid with clamp-to-edge addressing.
pub fn sample_bilinear(
    width: u32,
    height: u32,
    uv: [f32; 2],
    fetch: impl Fn(u32, u32) -> [f32; 4],
) -> [f32; 4] {
    let sx = uv[0] * width as f32 - 0.5;
    let sy = uv[1] * height as f32 - 0.5;
    let x0 = sx.floor();
    let y0 = sy.floor();
    let fx = sx - x0;
    let fy = sy - y0;

    let clamp_x = |x: f32| (x.max(0.0) as u32).min(width - 1);
    let clamp_y = |y: f32| (y.max(0.0) as u32).min(height - 1);
    let (xa, xb) = (clamp_x(x0), clamp_x(x0 + 1.0));
    let (ya, yb) = (clamp_y(y0), clamp_y(y0 + 1.0));

    let c00 = fetch(xa, ya);
    let c10 = fetch(xb, ya);
    let c01 = fetch(xa, yb);
    let c11 = fetch(xb, yb);

    let mut out = [0.0; 4];
    for k in 0..4 {
        let bottom = c00[k] + (c10[k] - c00[k]) * fx;
        let top = c01[k] + (c11[k] - c01[k]) * fx;
        out[k] = bottom + (top - bottom) * fy;
    }
    out
}

pub fn sample_nearest(
    width: u32,
    height: u32,
    uv: [f32; 2],
    fetch: impl Fn(u32, u32) -> [f32; 4],
) -> [f32; 4] {
    let x = ((uv[0] * width as f32).floor().max(0.0) as u32).min(width - 1);
    let y = ((uv[1] * height as f32).floor().max(0.0) as u32).min(height - 1);
    fetch(x, y)
}

/// Center of texel `(x, y)` of a `width` x `height` target.
pub fn texel_center(x: u32, y: u32, width: u32, height: u32) -> [f32; 2] {
    [(x as f32 + 0.5) / width as f32, (y as f32 + 0.5) / height as f32]
}

/// Center coordinate plus its four neighbors one texel away.
#[derive(Debug, Clone, Copy)]
pub struct Stencil {
    pub uv: [f32; 2],
    pub left: [f32; 2],
    pub right: [f32; 2],
    pub top: [f32; 2],
    pub bottom: [f32; 2],
    pub texel: [f32; 2],
}

impl Stencil {
    pub fn new(uv: [f32; 2], texel: [f32; 2]) -> Self {
        Self {
            uv,
            left: [uv[0] - texel[0], uv[1]],
            right: [uv[0] + texel[0], uv[1]],
            top: [uv[0], uv[1] + texel[1]],
            bottom: [uv[0], uv[1] - texel[1]],
            texel,
        }
    }
}

pub fn curl<S: Sampler + ?Sized>(velocity: &S, st: &Stencil) -> f32 {
    let l = velocity.sample(st.left)[1];
    let r = velocity.sample(st.right)[1];
    let t = velocity.sample(st.top)[0];
    let b = velocity.sample(st.bottom)[0];
    0.5 * (r - l - t + b)
}

pub fn vorticity<V, C>(velocity: &V, curl: &C, st: &Stencil, strength: f32, dt: f32) -> [f32; 2]
where
    V: Sampler + ?Sized,
    C: Sampler + ?Sized,
{
    let l = curl.sample(st.left)[0];
    let r = curl.sample(st.right)[0];
    let t = curl.sample(st.top)[0];
    let b = curl.sample(st.bottom)[0];
    let c = curl.sample(st.uv)[0];

    let mut force = [0.5 * (t.abs() - b.abs()), 0.5 * (r.abs() - l.abs())];
    let len = (force[0] * force[0] + force[1] * force[1]).sqrt() + 0.0001;
    force[0] *= strength * c / len;
    force[1] *= strength * c / len;
    // Screen space y points the other way.
    force[1] = -force[1];

    let v = velocity.sample(st.uv);
    [v[0] + force[0] * dt, v[1] + force[1] * dt]
}

pub fn divergence<S: Sampler + ?Sized>(velocity: &S, st: &Stencil) -> f32 {
    let l = velocity.sample(st.left)[0];
    let r = velocity.sample(st.right)[0];
    let t = velocity.sample(st.top)[1];
    let b = velocity.sample(st.bottom)[1];
    0.5 * (r - l + t - b)
}

pub fn clear<S: Sampler + ?Sized>(source: &S, uv: [f32; 2], value: f32) -> [f32; 4] {
    source.sample(uv).map(|c| c * value)
}

/// One Jacobi relaxation step of the pressure Poisson equation.
pub fn pressure<P, D>(pressure: &P, divergence: &D, st: &Stencil) -> f32
where
    P: Sampler + ?Sized,
    D: Sampler + ?Sized,
{
    let l = pressure.sample(st.left)[0];
    let r = pressure.sample(st.right)[0];
    let t = pressure.sample(st.top)[0];
    let b = pressure.sample(st.bottom)[0];
    let div = divergence.sample(st.uv)[0];
    (l + r + b + t - div) * 0.25
}

pub fn gradient_subtract<P, V>(pressure: &P, velocity: &V, st: &Stencil) -> [f32; 2]
where
    P: Sampler + ?Sized,
    V: Sampler + ?Sized,
{
    let l = pressure.sample(st.left)[0];
    let r = pressure.sample(st.right)[0];
    let t = pressure.sample(st.top)[0];
    let b = pressure.sample(st.bottom)[0];
    let v = velocity.sample(st.uv);
    [v[0] - (r - l), v[1] - (t - b)]
}

/// Semi-Lagrangian back trace. Dissipation divides, so magnitudes only
/// shrink for any `dt >= 0` and `dissipation >= 0`.
pub fn advect<V, S>(
    velocity: &V,
    source: &S,
    uv: [f32; 2],
    texel: [f32; 2],
    dt: f32,
    dissipation: f32,
) -> [f32; 4]
where
    V: Sampler + ?Sized,
    S: Sampler + ?Sized,
{
    let v = velocity.sample(uv);
    let coord = [uv[0] - dt * v[0] * texel[0], uv[1] - dt * v[1] * texel[1]];
    let decay = 1.0 + dissipation * dt;
    source.sample(coord).map(|c| c / decay)
}

pub fn splat_weight(uv: [f32; 2], point: [f32; 2], radius: f32, aspect_ratio: f32) -> f32 {
    let px = (uv[0] - point[0]) * aspect_ratio;
    let py = uv[1] - point[1];
    (-(px * px + py * py) / radius).exp()
}

pub fn splat<S: Sampler + ?Sized>(
    target: &S,
    uv: [f32; 2],
    point: [f32; 2],
    value: [f32; 3],
    radius: f32,
    aspect_ratio: f32,
) -> [f32; 4] {
    let w = splat_weight(uv, point, radius, aspect_ratio);
    let base = target.sample(uv);
    [base[0] + w * value[0], base[1] + w * value[1], base[2] + w * value[2], 1.0]
}

fn rgb_length(c: [f32; 4]) -> f32 {
    (c[0] * c[0] + c[1] * c[1] + c[2] * c[2]).sqrt()
}

/// Dye color with optional luminance-gradient shading; alpha is the
/// strongest channel so the output composites as premultiplied color.
pub fn display<S: Sampler + ?Sized>(dye: &S, st: &Stencil, shading: bool) -> [f32; 4] {
    let c = dye.sample(st.uv);
    let mut rgb = [c[0], c[1], c[2]];
    if shading {
        let dx = rgb_length(dye.sample(st.right)) - rgb_length(dye.sample(st.left));
        let dy = rgb_length(dye.sample(st.top)) - rgb_length(dye.sample(st.bottom));
        let dz = (st.texel[0] * st.texel[0] + st.texel[1] * st.texel[1]).sqrt();
        let n_z = dz / (dx * dx + dy * dy + dz * dz).sqrt();
        let light = (n_z + 0.7).clamp(0.7, 1.0);
        rgb = rgb.map(|v| v * light);
    }
    [rgb[0], rgb[1], rgb[2], rgb[0].max(rgb[1]).max(rgb[2])]
}

/// `ONE, ONE_MINUS_SRC_ALPHA` blend of a display texel over the clear color.
pub fn composite(src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let keep = 1.0 - src[3];
    [
        src[0] + dst[0] * keep,
        src[1] + dst[1] * keep,
        src[2] + dst[2] * keep,
        src[3] + dst[3] * keep,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Analytic field evaluated directly at the sample coordinate.
    struct Analytic<F: Fn([f32; 2]) -> [f32; 4]>(F);

    impl<F: Fn([f32; 2]) -> [f32; 4]> Sampler for Analytic<F> {
        fn sample(&self, uv: [f32; 2]) -> [f32; 4] {
            (self.0)(uv)
        }
    }

    const TEXEL: [f32; 2] = [1.0 / 64.0, 1.0 / 64.0];

    #[test]
    fn bilinear_clamps_at_edges() {
        let fetch = |x: u32, _y: u32| [x as f32, 0.0, 0.0, 0.0];
        assert_eq!(sample_bilinear(4, 4, [-1.0, 0.5], fetch)[0], 0.0);
        assert_eq!(sample_bilinear(4, 4, [2.0, 0.5], fetch)[0], 3.0);
        // Halfway between texel 1 and 2.
        assert!((sample_bilinear(4, 4, [0.5, 0.5], fetch)[0] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn nearest_picks_containing_texel() {
        let fetch = |x: u32, y: u32| [x as f32, y as f32, 0.0, 0.0];
        assert_eq!(sample_nearest(4, 2, [0.6, 0.9], fetch), [2.0, 1.0, 0.0, 0.0]);
        assert_eq!(sample_nearest(4, 2, [1.0, 1.0], fetch), [3.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn rigid_rotation_has_uniform_curl() {
        // v = (-y, x) rotates counter-clockwise.
        let field = Analytic(|uv: [f32; 2]| [-(uv[1] - 0.5), uv[0] - 0.5, 0.0, 0.0]);
        let st = Stencil::new([0.3, 0.7], TEXEL);
        assert!((curl(&field, &st) - 2.0 * TEXEL[0]).abs() < 1e-6);
    }

    #[test]
    fn expansion_has_positive_divergence() {
        let field = Analytic(|uv: [f32; 2]| [uv[0], uv[1], 0.0, 0.0]);
        let st = Stencil::new([0.5, 0.5], TEXEL);
        assert!((divergence(&field, &st) - 2.0 * TEXEL[0]).abs() < 1e-6);
    }

    #[test]
    fn vorticity_without_curl_leaves_velocity() {
        let velocity = Analytic(|_| [1.0, -2.0, 0.0, 0.0]);
        let curl = Analytic(|_| [0.0; 4]);
        let st = Stencil::new([0.5, 0.5], TEXEL);
        assert_eq!(vorticity(&velocity, &curl, &st, 30.0, 0.016), [1.0, -2.0]);
    }

    #[test]
    fn vorticity_pushes_along_flipped_curl_gradient() {
        let velocity = Analytic(|_| [0.0; 4]);
        // |curl| grows to the right.
        let curl = Analytic(|uv: [f32; 2]| [uv[0], 0.0, 0.0, 0.0]);
        let st = Stencil::new([0.5, 0.5], TEXEL);
        let v = vorticity(&velocity, &curl, &st, 2.0, 0.5);
        assert!(v[0].abs() < 1e-6);
        // Unit force (0, 1) scaled by strength * curl * dt, then y flipped.
        let expected = -(2.0 * 0.5 * 0.5);
        assert!((v[1] - expected).abs() < 1e-2, "got {}", v[1]);
    }

    #[test]
    fn jacobi_step_matches_formula() {
        let p = Analytic(|uv: [f32; 2]| [if uv[0] > 0.5 { 4.0 } else { 0.0 }, 0.0, 0.0, 0.0]);
        let div = Analytic(|_| [2.0, 0.0, 0.0, 0.0]);
        let st = Stencil::new([0.5, 0.5], TEXEL);
        assert!((pressure(&p, &div, &st) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn gradient_subtract_removes_linear_pressure_slope() {
        let p = Analytic(|uv: [f32; 2]| [uv[0] * 64.0, 0.0, 0.0, 0.0]);
        let v = Analytic(|_| [5.0, 1.0, 0.0, 0.0]);
        let st = Stencil::new([0.5, 0.5], TEXEL);
        let out = gradient_subtract(&p, &v, &st);
        assert!((out[0] - 3.0).abs() < 1e-4);
        assert!((out[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn advection_never_amplifies() {
        let source = Analytic(|uv: [f32; 2]| [uv[0] * 3.0 - 1.0, -uv[1], 0.5, 1.0]);
        let velocity = Analytic(|uv: [f32; 2]| [200.0 * uv[1], -80.0, 0.0, 0.0]);
        for &dt in &[0.0f32, 0.001, 0.0166, 0.5, 3.0] {
            for &dissipation in &[0.0f32, 0.2, 2.0, 3.5, 50.0] {
                for &uv in &[[0.1f32, 0.2], [0.5, 0.5], [0.9, 0.7]] {
                    let v = velocity.sample(uv);
                    let coord = [uv[0] - dt * v[0] * TEXEL[0], uv[1] - dt * v[1] * TEXEL[1]];
                    let sampled = source.sample(coord);
                    let out = advect(&velocity, &source, uv, TEXEL, dt, dissipation);
                    for k in 0..4 {
                        assert!(out[k].abs() <= sampled[k].abs() + 1e-6);
                        assert!(out[k] * sampled[k] >= 0.0, "sign flipped");
                    }
                }
            }
        }
    }

    #[test]
    fn splat_falls_off_beyond_three_sigma() {
        let radius = 0.001f32;
        let cutoff = 3.0 * radius.sqrt();
        let zero = Analytic(|_| [0.0; 4]);
        let peak = splat(&zero, [0.5, 0.5], [0.5, 0.5], [1.0, 0.0, 0.0], radius, 1.0)[0];
        assert!((peak - 1.0).abs() < 1e-6);
        for &(dx, dy) in &[(1.01, 0.0), (0.0, 1.2), (0.8, 0.8), (-2.0, 0.5)] {
            let uv = [0.5 + dx * cutoff, 0.5 + dy * cutoff];
            let v = splat(&zero, uv, [0.5, 0.5], [1.0, 0.0, 0.0], radius, 1.0)[0];
            assert!(v < 1e-3 * peak, "weight {} at {:?}", v, uv);
        }
    }

    #[test]
    fn splat_distance_is_aspect_corrected() {
        let w = splat_weight([0.6, 0.5], [0.5, 0.5], 0.01, 2.0);
        assert!((w - (-0.04f32 / 0.01).exp()).abs() < 1e-6);
    }

    #[test]
    fn flat_dye_is_unshaded_and_alpha_is_max_channel() {
        let dye = Analytic(|_| [0.0, 0.38, 1.0, 1.0]);
        let st = Stencil::new([0.5, 0.5], [0.01, 0.01]);
        assert_eq!(display(&dye, &st, true), [0.0, 0.38, 1.0, 1.0]);
        assert_eq!(display(&dye, &st, false)[3], 1.0);
    }

    #[test]
    fn steep_dye_gradient_darkens_to_floor() {
        let dye = Analytic(|uv: [f32; 2]| [0.0, 0.0, uv[0] * 1000.0, 0.0]);
        let st = Stencil::new([0.5, 0.5], [0.001, 0.001]);
        let shaded = display(&dye, &st, true);
        assert!(shaded[2] >= 500.0 * 0.7 - 1e-2);
        assert!(shaded[2] < 500.0 * 0.71);
    }

    #[test]
    fn composite_over_opaque_background() {
        let out = composite([0.2, 0.0, 0.0, 0.5], [0.0, 0.0, 1.0, 1.0]);
        assert_eq!(out, [0.2, 0.0, 0.5, 1.0]);
    }
}
