//! Common test utilities for fixelstats integration tests

use std::path::{Path, PathBuf};

use fixelstats::fixel::{Fixel, FixelImage};
use fixelstats::msf_io::save_msf_to_file;
use fixelstats::tracks::save_tracks;

/// Create a unique scratch directory under the system temp dir
pub fn temp_workspace(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "fixelstats_it_{}_{}",
        name,
        std::process::id()
    ));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A mask of `n` voxels along x, one x-aligned fixel per voxel
pub fn chain_mask(n: usize, voxel_size: f64) -> FixelImage {
    let mut mask = FixelImage::new((n, 1, 1), (voxel_size, voxel_size, voxel_size));
    for v in 0..n {
        mask.voxels[v] = vec![Fixel {
            direction: [1.0, 0.0, 0.0],
            value: 1.0,
            size: 0.5,
        }];
    }
    mask
}

/// A subject image sharing the mask's geometry with the given fixel values
pub fn subject_like(mask: &FixelImage, values: &[f32]) -> FixelImage {
    let mut subject = FixelImage::new(mask.dims, mask.voxel_size);
    subject.affine = mask.affine;
    let mut index = 0;
    for (v, in_voxel) in mask.voxels.iter().enumerate() {
        subject.voxels[v] = in_voxel
            .iter()
            .map(|f| {
                let fixel = Fixel {
                    direction: f.direction,
                    value: values[index],
                    size: f.size,
                };
                index += 1;
                fixel
            })
            .collect();
    }
    subject
}

/// A straight x-aligned streamline crossing all `n` voxels of a chain mask
pub fn straight_track(n: usize, voxel_size: f64) -> Vec<[f32; 3]> {
    let step = (voxel_size / 2.0) as f32;
    let end = ((n as f64 - 0.6) * voxel_size) as f32;
    let mut points = Vec::new();
    let mut x = (-0.4 * voxel_size) as f32;
    while x <= end {
        points.push([x, 0.0, 0.0]);
        x += step;
    }
    points
}

/// Write the full input set for a pipeline run over a chain mask
///
/// `subject_values` holds one per-fixel value vector per subject; the
/// design assigns the first half of the subjects to group one. Returns the
/// populated argument struct.
pub fn build_workspace(
    dir: &Path,
    mask: &FixelImage,
    subject_values: &[Vec<f32>],
    num_tracks: usize,
) -> fixelstats::pipeline::StatsArgs {
    let mask_path = dir.join("mask.msf");
    save_msf_to_file(&mask_path, mask).unwrap();

    let mut list = String::new();
    for (s, values) in subject_values.iter().enumerate() {
        let name = format!("subject{}.msf", s);
        save_msf_to_file(&dir.join(&name), &subject_like(mask, values)).unwrap();
        list.push_str(&name);
        list.push('\n');
    }
    let list_path = dir.join("subjects.txt");
    std::fs::write(&list_path, list).unwrap();

    let subjects = subject_values.len();
    let half = subjects / 2;
    let mut design = String::new();
    for s in 0..subjects {
        design.push_str(if s < half { "1 0\n" } else { "0 1\n" });
    }
    let design_path = dir.join("design.txt");
    std::fs::write(&design_path, design).unwrap();
    let contrast_path = dir.join("contrast.txt");
    std::fs::write(&contrast_path, "1 -1\n").unwrap();

    let n = mask.dims.0;
    let (vsx, _, _) = mask.voxel_size;
    let tracks: Vec<Vec<[f32; 3]>> = (0..num_tracks).map(|_| straight_track(n, vsx)).collect();
    let tracks_path = dir.join("tracks.tck");
    save_tracks(&tracks_path, &tracks, tracks.len()).unwrap();

    fixelstats::pipeline::StatsArgs {
        input: list_path,
        template: mask_path,
        design: design_path,
        contrast: contrast_path,
        tracks: tracks_path,
        output: dir.join("stats").to_string_lossy().into_owned(),
        notest: false,
        nperms: 99,
        cfe_dh: 0.1,
        cfe_e: 2.0,
        cfe_h: 1.0,
        cfe_c: 0.1,
        angle: 30.0,
        connectivity: 0.01,
        smooth: 10.0,
        nonstationary: false,
        nperms_nonstationary: 50,
        seed: Some(12345),
    }
}

/// Assert that an output map carries exactly the mask's geometry
pub fn assert_geometry_matches(output: &FixelImage, mask: &FixelImage) {
    assert_eq!(output.dims, mask.dims, "voxel grid must match the mask");
    assert_eq!(output.voxels.len(), mask.voxels.len());
    for (out, reference) in output.voxels.iter().zip(mask.voxels.iter()) {
        assert_eq!(out.len(), reference.len(), "fixel count per voxel must match");
        for (fo, fm) in out.iter().zip(reference.iter()) {
            assert_eq!(fo.direction, fm.direction, "direction copied verbatim");
            assert_eq!(fo.size, fm.size, "size copied verbatim");
        }
    }
}
