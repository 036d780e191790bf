//! YUY2 to BGRA conversion with pre-computed lookup tables.
//!
//! BT.601 coefficients, fixed-point with an 8-bit shift:
//!   R = 1.164(Y-16) + 1.596(V-128)
//!   G = 1.164(Y-16) - 0.391(U-128) - 0.813(V-128)
//!   B = 1.164(Y-16) + 2.018(U-128)
//! The tables fold the multiplications away; the inner loop is lookups and
//! additions only.

use once_cell::sync::Lazy;

/// Five 256-entry contribution tables, one per (component, channel) pair.
pub struct YuvTables {
    pub y: [i32; 256],
    pub u_b: [i32; 256],
    pub u_g: [i32; 256],
    pub v_r: [i32; 256],
    pub v_g: [i32; 256],
}

impl YuvTables {
    /// Recomputes the tables from the coefficients. Exposed so tests can
    /// check the cached copy never drifts.
    pub fn compute() -> Self {
        let mut tables = YuvTables {
            y: [0; 256],
            u_b: [0; 256],
            u_g: [0; 256],
            v_r: [0; 256],
            v_g: [0; 256],
        };
        for i in 0..256 {
            let i = i as i32;
            tables.y[i as usize] = 298 * (i - 16);
            tables.u_b[i as usize] = 516 * (i - 128);
            tables.u_g[i as usize] = -100 * (i - 128);
            tables.v_r[i as usize] = 409 * (i - 128);
            tables.v_g[i as usize] = -208 * (i - 128);
        }
        tables
    }
}

static TABLES: Lazy<YuvTables> = Lazy::new(YuvTables::compute);

/// The process-wide tables, computed on first use and immutable after.
pub fn tables() -> &'static YuvTables {
    &TABLES
}

#[inline]
fn clamp8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Converts packed YUY2 into BGRA8888, row-major, alpha 0xFF.
///
/// `dst` must hold `width * height * 4` bytes. Rows are addressed through
/// explicit strides; a source shorter than `width * height * 2` converts
/// only the complete rows it contains and leaves the rest of `dst` alone.
pub fn yuy2_to_bgra(src: &[u8], width: usize, height: usize, dst: &mut [u8]) {
    debug_assert!(width % 2 == 0);
    debug_assert!(dst.len() >= width * height * 4);

    let t = tables();
    let src_stride = width * 2;
    let dst_stride = width * 4;

    for row in 0..height {
        let src_start = row * src_stride;
        if src_start + src_stride > src.len() {
            break;
        }
        let src_row = &src[src_start..src_start + src_stride];
        let dst_row = &mut dst[row * dst_stride..row * dst_stride + dst_stride];

        for (macro_pixel, out) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(8)) {
            let y0 = t.y[macro_pixel[0] as usize];
            let u = macro_pixel[1] as usize;
            let y1 = t.y[macro_pixel[2] as usize];
            let v = macro_pixel[3] as usize;

            let u_b = t.u_b[u];
            let u_g = t.u_g[u];
            let v_r = t.v_r[v];
            let v_g = t.v_g[v];

            out[0] = clamp8((y0 + u_b + 128) >> 8);
            out[1] = clamp8((y0 + u_g + v_g + 128) >> 8);
            out[2] = clamp8((y0 + v_r + 128) >> 8);
            out[3] = 255;

            out[4] = clamp8((y1 + u_b + 128) >> 8);
            out[5] = clamp8((y1 + u_g + v_g + 128) >> 8);
            out[6] = clamp8((y1 + v_r + 128) >> 8);
            out[7] = 255;
        }
    }
}
