//! Post-capture background masking: pixels to be ignored downstream get
//! alpha 0.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use image::RgbaImage;

use crate::cameras::is_image_file;
use crate::error::ScanError;

pub type Polygon = Vec<[f32; 2]>;

const MASKED_PREFIX: &str = "masked_";

pub fn mask_left_half(image: &mut RgbaImage) {
    let half = image.width() / 2;
    for (x, _, pixel) in image.enumerate_pixels_mut() {
        if x < half {
            pixel.0[3] = 0;
        }
    }
}

/// Even-odd rule, sampled at the pixel centre.
fn contains(polygon: &[[f32; 2]], x: f32, y: f32) -> bool {
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let [xi, yi] = polygon[i];
        let [xj, yj] = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub fn mask_polygons(image: &mut RgbaImage, polygons: &[Polygon]) {
    let (width, height) = image.dimensions();
    for polygon in polygons.iter().filter(|p| p.len() >= 3) {
        let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
        let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
        for &[x, y] in polygon {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        let x0 = min_x.floor().max(0.0) as u32;
        let y0 = min_y.floor().max(0.0) as u32;
        let x1 = (max_x.ceil().max(0.0) as u32).min(width);
        let y1 = (max_y.ceil().max(0.0) as u32).min(height);

        for y in y0..y1 {
            for x in x0..x1 {
                if contains(polygon, x as f32 + 0.5, y as f32 + 0.5) {
                    image.get_pixel_mut(x, y).0[3] = 0;
                }
            }
        }
    }
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(ScanError::InvalidInput(format!(
            "the folder '{}' does not exist",
            dir.display()
        ))
        .into());
    }
    let mut files: Vec<PathBuf> = dir
        .read_dir()?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_image_file(p))
        .collect();
    files.sort();
    Ok(files)
}

/// Transparency needs an alpha channel, so everything is written as PNG.
fn png_name(path: &Path, prefix: &str) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("{}: not a valid file name", path.display()))?;
    Ok(format!("{prefix}{stem}.png"))
}

/// Writes `masked_<name>.png` next to every image with its left half
/// transparent. Returns how many images were written.
pub fn mask_left_half_dir(dir: &Path) -> Result<usize> {
    let mut written = 0;
    for path in image_files(dir)? {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with(MASKED_PREFIX) {
            continue;
        }
        let result = png_name(&path, MASKED_PREFIX).and_then(|out_name| {
            let mut image = image::open(&path)?.into_rgba8();
            mask_left_half(&mut image);
            image.save(dir.join(&out_name))?;
            Ok(out_name)
        });
        match result {
            Ok(out_name) => {
                log::info!("Processed and saved {out_name}");
                written += 1;
            }
            Err(e) => log::error!("Failed to process {}: {e:#}", path.display()),
        }
    }
    Ok(written)
}

pub fn load_polygon_file(path: &Path) -> Result<BTreeMap<String, Vec<Polygon>>> {
    let text =
        std::fs::read_to_string(path).map_err(|e| anyhow!("{}: {e}", path.display()))?;
    let polygons = serde_json::from_str(&text)
        .map_err(|e| ScanError::InvalidInput(format!("{}: {e}", path.display())))?;
    Ok(polygons)
}

/// Applies the polygons listed per file name, in place. Images without an
/// entry are left alone.
pub fn mask_polygons_dir(dir: &Path, polygon_file: &Path) -> Result<usize> {
    let polygons = load_polygon_file(polygon_file)?;
    let mut written = 0;
    for path in image_files(dir)? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(shapes) = polygons.get(name) else {
            continue;
        };
        let result = png_name(&path, "").and_then(|out_name| {
            let mut image = image::open(&path)?.into_rgba8();
            mask_polygons(&mut image, shapes);
            image.save(dir.join(&out_name))?;
            Ok(out_name)
        });
        match result {
            Ok(out_name) => {
                log::info!("Processed and saved {out_name}");
                written += 1;
            }
            Err(e) => log::error!("Failed to process {}: {e:#}", path.display()),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn opaque(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]))
    }

    #[test]
    fn left_half_becomes_transparent() {
        let mut image = opaque(5, 2);
        mask_left_half(&mut image);
        for (x, _, pixel) in image.enumerate_pixels() {
            let expected = if x < 2 { 0 } else { 255 };
            assert_eq!(pixel.0[3], expected, "alpha at x={x}");
            assert_eq!(&pixel.0[..3], &[10, 20, 30]);
        }
    }

    #[test]
    fn polygon_interior_is_cleared() {
        let mut image = opaque(10, 10);
        let square: Polygon = vec![[2.0, 2.0], [6.0, 2.0], [6.0, 6.0], [2.0, 6.0]];
        mask_polygons(&mut image, &[square]);

        assert_eq!(image.get_pixel(3, 3).0[3], 0);
        assert_eq!(image.get_pixel(5, 5).0[3], 0);
        assert_eq!(image.get_pixel(1, 1).0[3], 255);
        assert_eq!(image.get_pixel(6, 6).0[3], 255);
        let cleared = image.pixels().filter(|p| p.0[3] == 0).count();
        assert_eq!(cleared, 16);
    }

    #[test]
    fn degenerate_and_out_of_bounds_polygons_are_harmless() {
        let mut image = opaque(4, 4);
        let line: Polygon = vec![[0.0, 0.0], [3.0, 3.0]];
        let outside: Polygon = vec![[-10.0, -10.0], [100.0, -10.0], [100.0, 100.0]];
        mask_polygons(&mut image, &[line]);
        assert!(image.pixels().all(|p| p.0[3] == 255));
        mask_polygons(&mut image, &[outside]);
        assert!(image.pixels().any(|p| p.0[3] == 0));
    }

    #[test]
    fn directory_pass_writes_masked_copies() {
        let dir = tempfile::tempdir().unwrap();
        opaque(4, 4).save(dir.path().join("0.png")).unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"skip me").unwrap();

        assert_eq!(mask_left_half_dir(dir.path()).unwrap(), 1);
        let masked = image::open(dir.path().join("masked_0.png"))
            .unwrap()
            .into_rgba8();
        assert_eq!(masked.get_pixel(0, 0).0[3], 0);
        assert_eq!(masked.get_pixel(3, 0).0[3], 255);

        // a second pass leaves earlier output alone
        assert_eq!(mask_left_half_dir(dir.path()).unwrap(), 1);
        assert!(!dir.path().join("masked_masked_0.png").exists());
    }

    #[test]
    fn missing_directory_is_reported() {
        assert!(mask_left_half_dir(Path::new("no/such/folder")).is_err());
    }

    #[test]
    fn polygon_file_masks_in_place() {
        let dir = tempfile::tempdir().unwrap();
        opaque(4, 4).save(dir.path().join("0.png")).unwrap();
        opaque(4, 4).save(dir.path().join("1.png")).unwrap();
        let polygon_file = dir.path().join("polygons.json");
        std::fs::write(
            &polygon_file,
            r#"{ "0.png": [ [[0, 0], [4, 0], [4, 2], [0, 2]] ] }"#,
        )
        .unwrap();

        assert_eq!(mask_polygons_dir(dir.path(), &polygon_file).unwrap(), 1);
        let first = image::open(dir.path().join("0.png")).unwrap().into_rgba8();
        assert_eq!(first.get_pixel(1, 0).0[3], 0);
        assert_eq!(first.get_pixel(1, 3).0[3], 255);
        let second = image::open(dir.path().join("1.png")).unwrap().into_rgba8();
        assert!(second.pixels().all(|p| p.0[3] == 255));
    }
}
