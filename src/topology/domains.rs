use nalgebra as na;

use super::{DomainBuilder, Extremity, MultipatchDomain, Orientation, Patch, PatchFace, TopologyError};
use crate::mapping::{AffineMapping, PolarMapping};

/// A rectangle split into a grid of axis-aligned patches.
///
/// `ncells[i][j]` describes the patch in column `i` (x direction)
/// and row `j` (y direction):
/// `Some(n)` is a patch with `n` cells along both axes,
/// `None` leaves a hole in the grid.
/// All neighboring patches are glued with aligned interfaces,
/// which are non-matching wherever neighbors have different cell counts.
/// The remaining faces form the Dirichlet boundary.
pub fn square_grid(
    name: &str,
    degree: [usize; 2],
    ncells: &[Vec<Option<usize>>],
    x_interval: (f64, f64),
    y_interval: (f64, f64),
) -> Result<MultipatchDomain, TopologyError> {
    let cols = ncells.len();
    let rows = ncells.iter().map(|col| col.len()).max().unwrap_or(0);
    let dx = (x_interval.1 - x_interval.0) / cols.max(1) as f64;
    let dy = (y_interval.1 - y_interval.0) / rows.max(1) as f64;

    let mut builder = DomainBuilder::new(name);
    // patch index of each grid position
    let mut indices: Vec<Vec<Option<usize>>> = vec![vec![None; rows]; cols];
    for (i, col) in ncells.iter().enumerate() {
        for (j, n) in col.iter().enumerate() {
            let Some(n) = *n else { continue };
            let x0 = x_interval.0 + i as f64 * dx;
            let y0 = y_interval.0 + j as f64 * dy;
            let patch = Patch::new(format!("{name}[{i},{j}]"), degree, [n, n])
                .with_mapping(AffineMapping::rectangle((x0, x0 + dx), (y0, y0 + dy)));
            indices[i][j] = Some(builder.add_patch(patch));
        }
    }

    for i in 0..cols {
        for j in 0..rows {
            let Some(here) = indices[i][j] else { continue };
            if let Some(Some(right)) = indices.get(i + 1).map(|col| col[j]) {
                builder.add_interface(
                    PatchFace::new(here, 0, Extremity::End),
                    PatchFace::new(right, 0, Extremity::Start),
                    Orientation::Aligned,
                );
            }
            if let Some(&Some(up)) = indices[i].get(j + 1) {
                builder.add_interface(
                    PatchFace::new(here, 1, Extremity::End),
                    PatchFace::new(up, 1, Extremity::Start),
                    Orientation::Aligned,
                );
            }
        }
    }

    builder.build()
}

/// Two unit squares side by side on [0, 2] × [0, 1],
/// with `ncells[0]` and `ncells[1]` cells per direction respectively.
pub fn two_patch(degree: usize, ncells: [usize; 2]) -> Result<MultipatchDomain, TopologyError> {
    square_grid(
        "two_patch",
        [degree, degree],
        &[vec![Some(ncells[0])], vec![Some(ncells[1])]],
        (0., 2.),
        (0., 1.),
    )
}

/// The L-shaped domain [-1, 1]² \ (0, 1]² made of three square patches.
pub fn l_shape(degree: usize, ncells: usize) -> Result<MultipatchDomain, TopologyError> {
    square_grid(
        "l_shape",
        [degree, degree],
        &[
            vec![Some(ncells), Some(ncells)],
            vec![Some(ncells), None],
        ],
        (-1., 1.),
        (-1., 1.),
    )
}

/// An annulus split into `sectors` polar patches around the origin.
///
/// Axis 0 of each patch is radial with `ncells[0]` cells,
/// axis 1 angular with `ncells[1]` cells.
/// The inner and outer circles form the Dirichlet boundary.
pub fn annulus(
    degree: [usize; 2],
    ncells: [usize; 2],
    sectors: usize,
    radii: (f64, f64),
) -> Result<MultipatchDomain, TopologyError> {
    let mut builder = DomainBuilder::new("annulus");
    let sector_angle = std::f64::consts::TAU / sectors.max(1) as f64;
    for k in 0..sectors {
        let mapping = PolarMapping {
            center: na::Vector2::zeros(),
            radii,
            angles: (k as f64 * sector_angle, (k + 1) as f64 * sector_angle),
        };
        builder.add_patch(Patch::new(format!("annulus[{k}]"), degree, ncells).with_mapping(mapping));
    }
    for k in 0..sectors {
        builder.add_interface(
            PatchFace::new(k, 1, Extremity::End),
            PatchFace::new((k + 1) % sectors, 1, Extremity::Start),
            Orientation::Aligned,
        );
    }
    builder.build()
}
