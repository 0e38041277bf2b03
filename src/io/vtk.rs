use crate::space::FiniteElementSpace;
use eyre::{bail, eyre};
use nalgebra::DVector;
use std::convert::TryInto;
use std::path::Path;
use vtkio::model::{
    Attribute, Attributes, ByteOrder, CellType, Cells, DataSet, Piece, UnstructuredGridPiece, Version, VertexNumbers,
    Vtk,
};

/// Builds VTK unstructured grids from finite element spaces and discrete functions on them.
///
/// Degree 2 spaces are written as quadratic triangles, whose node order (vertices, then the
/// midpoints of edges 01, 12 and 20) matches the local node order of the space.
pub struct FiniteElementSpaceDataSetBuilder<'a> {
    space: &'a FiniteElementSpace,
    point_data: Vec<Attribute>,
    cell_data: Vec<Attribute>,

    // Only used for exporting directly to file
    title: Option<String>,
}

impl<'a> FiniteElementSpaceDataSetBuilder<'a> {
    pub fn from_space(space: &'a FiniteElementSpace) -> Self {
        Self {
            space,
            point_data: Vec::new(),
            cell_data: Vec::new(),
            title: None,
        }
    }

    pub fn with_title(self, title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..self
        }
    }

    /// Attaches a discrete function as nodal data. Vector valued functions are padded to three
    /// components.
    pub fn with_solution(mut self, name: impl Into<String>, coefficients: &DVector<f64>) -> eyre::Result<Self> {
        let dim = self.space.solution_dim();
        if coefficients.len() != self.space.num_dofs() {
            bail!(
                "solution has {} entries, but the space has {} dofs",
                coefficients.len(),
                self.space.num_dofs()
            );
        }
        let attribute = if dim == 1 {
            Attribute::scalars(name, 1).with_data(coefficients.as_slice().to_vec())
        } else {
            let mut data = Vec::with_capacity(3 * self.space.num_nodes());
            for node in coefficients.as_slice().chunks(dim) {
                data.extend_from_slice(node);
                data.resize(data.len() + 3 - dim, 0.0);
            }
            Attribute::scalars(name, 3).with_data(data)
        };
        self.point_data.push(attribute);
        Ok(self)
    }

    /// Attaches one value per cell, e.g. an error indicator.
    pub fn with_cell_scalars(mut self, name: impl Into<String>, values: &[f64]) -> eyre::Result<Self> {
        if values.len() != self.space.num_cells() {
            bail!(
                "{} cell values given for a mesh with {} cells",
                values.len(),
                self.space.num_cells()
            );
        }
        self.cell_data
            .push(Attribute::scalars(name, 1).with_data(values.to_vec()));
        Ok(self)
    }

    pub fn try_build(&self) -> eyre::Result<DataSet> {
        let space = self.space;
        let points: Vec<f64> = (0..space.num_nodes())
            .flat_map(|node| {
                let p = space.node_position(node);
                [p.x, p.y, 0.0]
            })
            .collect();

        // Vertices is laid out as follows: N, i_1, i_2, ... i_N
        let nodes_per_cell = space.nodes_per_cell();
        let cell_type = if space.degree() == 1 {
            CellType::Triangle
        } else {
            CellType::QuadraticTriangle
        };
        let mut vertices = Vec::with_capacity((nodes_per_cell + 1) * space.num_cells());
        for cell in 0..space.num_cells() {
            vertices.push(nodes_per_cell.try_into()?);
            for &node in space.cell_nodes(cell) {
                vertices.push(
                    node.try_into()
                        .map_err(|_| eyre!("node index {} does not fit the VTK format", node))?,
                );
            }
        }

        let piece = UnstructuredGridPiece {
            points: points.into(),
            cells: Cells {
                cell_verts: VertexNumbers::Legacy {
                    num_cells: space.num_cells().try_into()?,
                    vertices,
                },
                types: vec![cell_type; space.num_cells()],
            },
            data: Attributes {
                point: self.point_data.clone(),
                cell: self.cell_data.clone(),
            },
        };

        Ok(DataSet::UnstructuredGrid {
            meta: None,
            pieces: vec![Piece::Inline(Box::new(piece))],
        })
    }

    /// Convenience function for directly exporting the dataset to a file.
    pub fn try_export(&self, filename: impl AsRef<Path>) -> eyre::Result<()> {
        let filepath = filename.as_ref();
        let fallback_title = filepath
            .file_stem()
            .map(|os_str| os_str.to_string_lossy().to_string())
            .unwrap_or_else(|| "untitled".to_string());
        let dataset = self.try_build()?;
        if let Some(parent) = filepath.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| eyre!("cannot create directory {}: {}", parent.display(), err))?;
        }
        Vtk {
            version: Version { major: 4, minor: 1 },
            // If we don't have a title then just make the filepath the title
            title: self.title.clone().unwrap_or(fallback_title),
            byte_order: ByteOrder::BigEndian,
            data: dataset,
            file_path: None,
        }
        .export(filepath)
        .map_err(|err| eyre!("failed to write {}: {}", filepath.display(), err))?;
        Ok(())
    }
}
