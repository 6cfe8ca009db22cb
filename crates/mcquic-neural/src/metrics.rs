//! Image quality metrics

use mcquic_core::{psnr, Error, ImageTensor, Result};

/// Per-scale weights of the 5-scale MS-SSIM.
pub const MS_SSIM_WEIGHTS: [f64; 5] = [0.0448, 0.2856, 0.3001, 0.2363, 0.1333];

const WINDOW: usize = 11;
const SIGMA: f64 = 1.5;
const C1: f64 = 0.01 * 0.01;
const C2: f64 = 0.03 * 0.03;

fn check_pair(a: &ImageTensor, b: &ImageTensor) -> Result<()> {
    if a.size() != b.size() {
        return Err(Error::shape(a.size(), b.size()));
    }
    if a.data.is_empty() {
        return Err(Error::shape("non-empty image", "0 samples"));
    }
    Ok(())
}

/// Mean squared error over all samples.
pub fn mse(a: &ImageTensor, b: &ImageTensor) -> Result<f64> {
    check_pair(a, b)?;
    let sum: f64 = a
        .data
        .iter()
        .zip(&b.data)
        .map(|(x, y)| {
            let d = (*x as f64) - (*y as f64);
            d * d
        })
        .sum();
    Ok(sum / a.data.len() as f64)
}

/// Peak signal-to-noise ratio in dB for unit-range images.
pub fn psnr_between(a: &ImageTensor, b: &ImageTensor) -> Result<f64> {
    Ok(psnr(mse(a, b)?))
}

/// Multi-scale structural similarity, averaged over channels.
///
/// Images too small for five scales use as many as fit, with the weights
/// renormalised. Images smaller than the window shrink the window.
pub fn ms_ssim(a: &ImageTensor, b: &ImageTensor) -> Result<f64> {
    check_pair(a, b)?;

    let min_side = a.height.min(a.width);
    let mut scales = 1;
    while scales < MS_SSIM_WEIGHTS.len() && (min_side >> scales) >= WINDOW {
        scales += 1;
    }
    let size = WINDOW.min(if min_side % 2 == 0 { min_side - 1 } else { min_side }).max(1);
    let window = gaussian_window(size, SIGMA);

    let weights = &MS_SSIM_WEIGHTS[..scales];
    let total: f64 = weights.iter().sum();

    let mut xs: Vec<Plane> = (0..a.channel).map(|c| Plane::channel(a, c)).collect();
    let mut ys: Vec<Plane> = (0..b.channel).map(|c| Plane::channel(b, c)).collect();

    let mut result = 1.0;
    for (s, w) in weights.iter().enumerate() {
        let mut ssim_sum = 0.0;
        let mut cs_sum = 0.0;
        for (x, y) in xs.iter().zip(&ys) {
            let (ssim, cs) = ssim_components(x, y, &window);
            ssim_sum += ssim;
            cs_sum += cs;
        }
        let n = xs.len() as f64;
        let value = if s + 1 == scales { ssim_sum / n } else { cs_sum / n };
        result *= value.max(0.0).powf(w / total);

        if s + 1 < scales {
            xs = xs.iter().map(Plane::half).collect();
            ys = ys.iter().map(Plane::half).collect();
        }
    }
    Ok(result)
}

#[derive(Debug, Clone)]
struct Plane {
    h: usize,
    w: usize,
    data: Vec<f64>,
}

impl Plane {
    fn channel(image: &ImageTensor, c: usize) -> Self {
        Self {
            h: image.height,
            w: image.width,
            data: image
                .data
                .iter()
                .skip(c)
                .step_by(image.channel)
                .map(|&v| v as f64)
                .collect(),
        }
    }

    fn half(&self) -> Self {
        let h = self.h / 2;
        let w = self.w / 2;
        let mut data = Vec::with_capacity(h * w);
        for y in 0..h {
            for x in 0..w {
                let at = |yy: usize, xx: usize| self.data[yy * self.w + xx];
                data.push(
                    (at(2 * y, 2 * x) + at(2 * y, 2 * x + 1) + at(2 * y + 1, 2 * x) + at(2 * y + 1, 2 * x + 1))
                        / 4.0,
                );
            }
        }
        Self { h, w, data }
    }

    fn map2(&self, other: &Plane, f: impl Fn(f64, f64) -> f64) -> Plane {
        Plane {
            h: self.h,
            w: self.w,
            data: self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect(),
        }
    }

    /// Separable "valid" convolution.
    fn filter(&self, window: &[f64]) -> Plane {
        let size = window.len();
        let ow = self.w + 1 - size;
        let oh = self.h + 1 - size;

        let mut rows: Vec<f64> = Vec::with_capacity(self.h * ow);
        for y in 0..self.h {
            let line = &self.data[y * self.w..(y + 1) * self.w];
            for x in 0..ow {
                rows.push(line[x..x + size].iter().zip(window).map(|(a, b)| a * b).sum());
            }
        }

        let mut data: Vec<f64> = Vec::with_capacity(oh * ow);
        for y in 0..oh {
            for x in 0..ow {
                let mut acc = 0.0;
                for (i, wv) in window.iter().enumerate() {
                    acc += rows[(y + i) * ow + x] * wv;
                }
                data.push(acc);
            }
        }
        Plane { h: oh, w: ow, data }
    }

    fn mean(&self) -> f64 {
        self.data.iter().sum::<f64>() / self.data.len().max(1) as f64
    }
}

fn gaussian_window(size: usize, sigma: f64) -> Vec<f64> {
    let center = (size / 2) as f64;
    let mut w: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - center;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = w.iter().sum();
    for v in &mut w {
        *v /= sum;
    }
    w
}

/// Mean SSIM and mean contrast-structure term of one plane pair.
fn ssim_components(x: &Plane, y: &Plane, window: &[f64]) -> (f64, f64) {
    let mu_x = x.filter(window);
    let mu_y = y.filter(window);
    let sxx = x.map2(x, |a, b| a * b).filter(window);
    let syy = y.map2(y, |a, b| a * b).filter(window);
    let sxy = x.map2(y, |a, b| a * b).filter(window);

    let mut ssim = Vec::with_capacity(mu_x.data.len());
    let mut cs = Vec::with_capacity(mu_x.data.len());
    for i in 0..mu_x.data.len() {
        let (mx, my) = (mu_x.data[i], mu_y.data[i]);
        let vx = sxx.data[i] - mx * mx;
        let vy = syy.data[i] - my * my;
        let cov = sxy.data[i] - mx * my;
        let c = (2.0 * cov + C2) / (vx + vy + C2);
        let l = (2.0 * mx * my + C1) / (mx * mx + my * my + C1);
        cs.push(c);
        ssim.push(l * c);
    }
    let ssim = Plane { h: 1, w: ssim.len(), data: ssim };
    let cs = Plane { h: 1, w: cs.len(), data: cs };
    (ssim.mean(), cs.mean())
}
