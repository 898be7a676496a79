//! Watershed-based tree crown delineation.
//!
//! Pipeline: height threshold → anti-aliased downsample → gaussian smooth →
//! local maxima (candidate apexes) → marker-controlled watershed → polygon
//! extraction. An empty result is legitimate here (no apexes found); the
//! carbon stage decides whether that is a failure.

use crate::config::DelineationConfig;
use crate::error::StageError;
use crate::raster::{downsample_area, gaussian_blur, GeoTransform, Raster};
use crate::vector::{shoelace_area, CrownPolygon};
use ndarray::Array2;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::fs::File;
use std::path::Path;

/// Delineate individual tree crowns on a canopy height raster.
///
/// Returns one polygon per watershed region larger than the fragment
/// threshold, in ascending label order. Zero detected apexes yields an empty
/// collection, not an error.
pub fn delineate_crowns(chm: &Raster, config: &DelineationConfig) -> Vec<CrownPolygon> {
    // Ground-noise suppression: everything below the minimum height is
    // treated as bare ground. NaN cells (nodata) are grounded too.
    let mut work = chm.clone();
    work.data.mapv_inplace(|v| {
        if v.is_nan() || v < config.min_height_m {
            0.0
        } else {
            v
        }
    });

    let small = downsample_area(&work, config.scale_factor);
    let smooth = gaussian_blur(&small, config.smoothing_sigma);

    let apexes = local_maxima(&smooth.data, &small.data, config.min_peak_distance);
    tracing::info!("detected {} candidate apexes", apexes.len());
    if apexes.is_empty() {
        return Vec::new();
    }

    let labels = watershed(&smooth.data, &small.data, &apexes);
    let crowns = vectorize_labels(
        &labels,
        apexes.len() as u32,
        &small.transform,
        config.min_crown_area_sqm,
    );
    tracing::info!(
        "delineated {} crowns ({} apexes, fragment threshold {} m2)",
        crowns.len(),
        apexes.len(),
        config.min_crown_area_sqm
    );
    crowns
}

/// Local maxima with a minimum pairwise separation, restricted to cells
/// where `mask` is positive.
///
/// A cell qualifies if it is the maximum of its `(2d+1)^2` window; among
/// qualifying cells closer than `d` (euclidean), the higher one wins, ties
/// broken by row-major position so detection is deterministic.
fn local_maxima(surface: &Array2<f64>, mask: &Array2<f64>, min_distance: usize) -> Vec<(usize, usize)> {
    let (rows, cols) = surface.dim();
    let d = min_distance as isize;

    let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
    for r in 0..rows {
        for c in 0..cols {
            if !(mask[[r, c]] > 0.0) {
                continue;
            }
            let v = surface[[r, c]];
            if !v.is_finite() {
                continue;
            }
            let mut is_max = true;
            'window: for dr in -d..=d {
                for dc in -d..=d {
                    if dr == 0 && dc == 0 {
                        continue;
                    }
                    let rr = r as isize + dr;
                    let cc = c as isize + dc;
                    if rr < 0 || cc < 0 || rr >= rows as isize || cc >= cols as isize {
                        continue;
                    }
                    let n = surface[[rr as usize, cc as usize]];
                    if n.is_finite() && n > v {
                        is_max = false;
                        break 'window;
                    }
                }
            }
            if is_max {
                candidates.push((r, c, v));
            }
        }
    }

    // Greedy suppression: strongest first, reject anything within min_distance
    // of an accepted apex (plateaus produce window-equal candidates).
    candidates.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(Ordering::Equal)
            .then_with(|| (a.0, a.1).cmp(&(b.0, b.1)))
    });
    let dist2 = (min_distance * min_distance) as f64;
    let mut accepted: Vec<(usize, usize)> = Vec::new();
    for (r, c, _) in candidates {
        // Separation of exactly min_distance is allowed.
        let ok = accepted.iter().all(|&(ar, ac)| {
            let dr = ar as f64 - r as f64;
            let dc = ac as f64 - c as f64;
            dr * dr + dc * dc >= dist2
        });
        if ok {
            accepted.push((r, c));
        }
    }

    // Markers are numbered in row-major order.
    accepted.sort();
    accepted
}

/// Flood-queue entry. Max-heap by priority (canopy height), FIFO among equal
/// priorities so flooding order is deterministic.
struct FloodItem {
    priority: f64,
    seq: u64,
    row: usize,
    col: usize,
    label: u32,
}

impl PartialEq for FloodItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for FloodItem {}
impl PartialOrd for FloodItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FloodItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .partial_cmp(&other.priority)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Marker-controlled watershed, restricted to the positive mask.
///
/// Equivalent to flooding the negated surface from the markers: regions grow
/// to their highest unclaimed neighbour first, so touching crowns split along
/// the valley between apexes.
fn watershed(surface: &Array2<f64>, mask: &Array2<f64>, apexes: &[(usize, usize)]) -> Array2<u32> {
    let (rows, cols) = surface.dim();
    let mut labels: Array2<u32> = Array2::zeros((rows, cols));
    let mut heap: BinaryHeap<FloodItem> = BinaryHeap::new();
    let mut seq: u64 = 0;

    for (i, &(r, c)) in apexes.iter().enumerate() {
        let label = i as u32 + 1;
        labels[[r, c]] = label;
        heap.push(FloodItem {
            priority: surface[[r, c]],
            seq,
            row: r,
            col: c,
            label,
        });
        seq += 1;
    }

    let neighbors: [(isize, isize); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
    while let Some(item) = heap.pop() {
        for &(dr, dc) in &neighbors {
            let rr = item.row as isize + dr;
            let cc = item.col as isize + dc;
            if rr < 0 || cc < 0 || rr >= rows as isize || cc >= cols as isize {
                continue;
            }
            let (rr, cc) = (rr as usize, cc as usize);
            if labels[[rr, cc]] != 0 || !(mask[[rr, cc]] > 0.0) {
                continue;
            }
            labels[[rr, cc]] = item.label;
            heap.push(FloodItem {
                priority: surface[[rr, cc]],
                seq,
                row: rr,
                col: cc,
                label: item.label,
            });
            seq += 1;
        }
    }

    labels
}

/// Trace each labelled region into a polygon in map coordinates.
///
/// Boundary edges between a labelled cell and anything else are emitted as
/// directed segments on the pixel lattice, stitched into closed rings, and
/// the largest ring per label becomes the crown outline. Regions at or below
/// `min_area` (single-pixel fragments and slivers) are dropped.
fn vectorize_labels(
    labels: &Array2<u32>,
    num_labels: u32,
    transform: &GeoTransform,
    min_area: f64,
) -> Vec<CrownPolygon> {
    let mut crowns = Vec::new();
    for label in 1..=num_labels {
        let Some(ring) = trace_region(labels, label) else {
            continue;
        };
        let world: Vec<(f64, f64)> = ring
            .iter()
            .map(|&(col, row)| transform.pixel_to_world(col as f64, row as f64))
            .collect();
        if shoelace_area(&world).abs() > min_area {
            crowns.push(CrownPolygon::new(label, world));
        }
    }
    crowns
}

/// Outer boundary ring of one label, as pixel-corner coordinates, or `None`
/// if the label claimed no cells.
fn trace_region(labels: &Array2<u32>, label: u32) -> Option<Vec<(i64, i64)>> {
    let (rows, cols) = labels.dim();

    // Directed boundary edges, clockwise around the region in pixel space:
    // corner keys are (col, row) lattice points.
    let mut edges: BTreeMap<(i64, i64), Vec<(i64, i64)>> = BTreeMap::new();
    let mut any = false;
    let at = |r: isize, c: isize| -> u32 {
        if r < 0 || c < 0 || r >= rows as isize || c >= cols as isize {
            0
        } else {
            labels[[r as usize, c as usize]]
        }
    };
    for r in 0..rows as isize {
        for c in 0..cols as isize {
            if at(r, c) != label {
                continue;
            }
            any = true;
            let (x, y) = (c as i64, r as i64);
            if at(r - 1, c) != label {
                edges.entry((x, y)).or_default().push((x + 1, y));
            }
            if at(r, c + 1) != label {
                edges.entry((x + 1, y)).or_default().push((x + 1, y + 1));
            }
            if at(r + 1, c) != label {
                edges.entry((x + 1, y + 1)).or_default().push((x, y + 1));
            }
            if at(r, c - 1) != label {
                edges.entry((x, y + 1)).or_default().push((x, y));
            }
        }
    }
    if !any {
        return None;
    }

    // Stitch directed edges into rings; keep the longest (outer) ring.
    let mut best: Option<Vec<(i64, i64)>> = None;
    while let Some((&start, _)) = edges.iter().next() {
        let mut ring = vec![start];
        let mut current = start;
        loop {
            let next = {
                let outs = edges.get_mut(&current)?;
                let next = outs.pop()?;
                if outs.is_empty() {
                    edges.remove(&current);
                }
                next
            };
            ring.push(next);
            if next == start {
                break;
            }
            current = next;
        }
        if best.as_ref().map_or(true, |b| ring.len() > b.len()) {
            best = Some(ring);
        }
    }
    best
}

/// Persist crowns as a `label_id, wkt` CSV artifact. An empty collection
/// writes a header-only file.
pub fn write_crowns(path: &Path, crowns: &[CrownPolygon]) -> Result<(), StageError> {
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    writer
        .write_record(["label_id", "wkt"])
        .map_err(|e| StageError::UnsupportedFormat(e.to_string()))?;
    for crown in crowns {
        writer
            .write_record([crown.label.to_string(), crown.to_wkt()])
            .map_err(|e| StageError::UnsupportedFormat(e.to_string()))?;
    }
    writer
        .flush()
        .map_err(|e| StageError::UnsupportedFormat(e.to_string()))?;
    Ok(())
}

/// Read a crowns artifact written by [`write_crowns`].
pub fn read_crowns(path: &Path) -> Result<Vec<CrownPolygon>, StageError> {
    if !path.exists() {
        return Err(StageError::InputMissing {
            path: path.to_path_buf(),
        });
    }
    let mut reader = csv::Reader::from_reader(File::open(path)?);
    let mut crowns = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| StageError::UnsupportedFormat(e.to_string()))?;
        let label: u32 = record
            .get(0)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| StageError::UnsupportedFormat("bad label_id column".into()))?;
        let wkt = record
            .get(1)
            .ok_or_else(|| StageError::UnsupportedFormat("missing wkt column".into()))?;
        crowns.push(CrownPolygon::from_wkt(label, wkt)?);
    }
    Ok(crowns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Raster;

    fn default_config() -> DelineationConfig {
        DelineationConfig {
            min_height_m: 1.0,
            scale_factor: 0.5,
            smoothing_sigma: 2.0,
            min_peak_distance: 3,
            min_crown_area_sqm: 2.0,
        }
    }

    /// CHM with conical crowns at the given centres (map coords).
    fn synthetic_chm(crowns: &[(f64, f64, f64, f64)]) -> Raster {
        let gt = GeoTransform::north_up(0.0, 50.0, 0.5, 0.5);
        let mut chm = Raster::filled(100, 100, 0.0, gt, "unspecified");
        for r in 0..100 {
            for c in 0..100 {
                let (x, y) = chm.cell_center(r, c);
                for &(cx, cy, radius, peak) in crowns {
                    let d = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
                    if d < radius {
                        let h = peak * (1.0 - d / radius);
                        if h > chm.data[[r, c]] {
                            chm.data[[r, c]] = h;
                        }
                    }
                }
            }
        }
        chm
    }

    #[test]
    fn test_single_crown_single_polygon() {
        let chm = synthetic_chm(&[(25.25, 25.25, 4.0, 10.0)]);
        let crowns = delineate_crowns(&chm, &default_config());
        assert_eq!(crowns.len(), 1);
        assert_eq!(crowns[0].label, 1);
        // Cone footprint above the 1 m threshold is ~ pi * 3.6^2 ~ 41 m2;
        // smoothing and downsampling keep it the same order of magnitude.
        let area = crowns[0].area();
        assert!(area > 10.0 && area < 120.0, "area = {}", area);
        // The apex must lie inside the crown outline.
        assert!(crowns[0].contains(25.25, 25.25));
    }

    #[test]
    fn test_all_zero_chm_yields_empty_collection() {
        let gt = GeoTransform::north_up(0.0, 50.0, 0.5, 0.5);
        let chm = Raster::filled(100, 100, 0.0, gt, "unspecified");
        assert!(delineate_crowns(&chm, &default_config()).is_empty());
    }

    #[test]
    fn test_below_threshold_canopy_is_ignored() {
        let chm = synthetic_chm(&[(25.25, 25.25, 4.0, 0.8)]);
        assert!(delineate_crowns(&chm, &default_config()).is_empty());
    }

    #[test]
    fn test_two_separated_crowns() {
        let chm = synthetic_chm(&[(13.25, 13.25, 4.0, 10.0), (37.25, 37.25, 4.0, 12.0)]);
        let crowns = delineate_crowns(&chm, &default_config());
        assert_eq!(crowns.len(), 2);
        let labels: Vec<u32> = crowns.iter().map(|c| c.label).collect();
        assert_eq!(labels, vec![1, 2]);
    }

    #[test]
    fn test_touching_crowns_split_by_watershed() {
        // Two apexes 7 m apart with overlapping 4.5 m skirts: a single
        // connected mask that must be divided along the valley.
        let chm = synthetic_chm(&[(21.25, 25.25, 4.5, 10.0), (28.25, 25.25, 4.5, 11.0)]);
        let crowns = delineate_crowns(&chm, &default_config());
        assert_eq!(crowns.len(), 2);
        assert!(crowns[0].contains(21.25, 25.25) ^ crowns[1].contains(21.25, 25.25));
        assert!(crowns[0].contains(28.25, 25.25) ^ crowns[1].contains(28.25, 25.25));
    }

    #[test]
    fn test_maxima_at_exact_min_distance_both_kept() {
        let mut surface = Array2::zeros((10, 10));
        surface[[3, 3]] = 5.0;
        surface[[3, 5]] = 5.0;
        surface[[3, 6]] = 5.0;
        let mask = surface.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        // (3,5) sits closer than the separation to (3,3) and is suppressed;
        // (3,6) is exactly min_distance away and is admitted.
        let apexes = local_maxima(&surface, &mask, 3);
        assert_eq!(apexes, vec![(3, 3), (3, 6)]);
    }

    #[test]
    fn test_watershed_partitions_mask() {
        let mut surface = Array2::zeros((5, 5));
        surface[[2, 1]] = 5.0;
        surface[[2, 3]] = 4.0;
        let mask = Array2::from_elem((5, 5), 1.0);
        let labels = watershed(&surface, &mask, &[(2, 1), (2, 3)]);
        // Every masked cell is claimed, and both labels are present.
        assert!(labels.iter().all(|&l| l > 0));
        assert_eq!(labels[[2, 1]], 1);
        assert_eq!(labels[[2, 3]], 2);
    }

    #[test]
    fn test_trace_region_square() {
        let mut labels: Array2<u32> = Array2::zeros((4, 4));
        for r in 1..3 {
            for c in 1..3 {
                labels[[r, c]] = 1;
            }
        }
        let ring = trace_region(&labels, 1).unwrap();
        assert_eq!(ring.first(), ring.last());
        // 2x2 block has 8 boundary edges, so 9 ring vertices with closure.
        assert_eq!(ring.len(), 9);
        let world: Vec<(f64, f64)> = ring.iter().map(|&(x, y)| (x as f64, y as f64)).collect();
        assert!((shoelace_area(&world).abs() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_crowns_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree_crowns.csv");
        let crowns = vec![
            CrownPolygon::new(1, vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 0.0)]),
            CrownPolygon::new(2, vec![(5.0, 5.0), (8.0, 5.0), (8.0, 9.0), (5.0, 5.0)]),
        ];
        write_crowns(&path, &crowns).unwrap();
        let back = read_crowns(&path).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].label, 2);
        assert_eq!(back[0].ring, crowns[0].ring);
    }

    #[test]
    fn test_empty_crowns_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree_crowns.csv");
        write_crowns(&path, &[]).unwrap();
        assert!(read_crowns(&path).unwrap().is_empty());
    }
}
