//! Visual graph consolidation.
//!
//! The staged MobileCLIP visual export may store its weight tensors in a
//! sibling external-data file. The on-device runtime expects one
//! self-contained artifact, so every externally-stored initializer is
//! inlined into the graph before it is persisted, and the staging files
//! are removed afterwards.

use anyhow::{anyhow, bail, Context, Result};
use candle_onnx::onnx;
use prost::Message;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Raw visual export as staged on disk: the graph file plus any
/// external-data siblings it references.
pub struct StagedVisual {
    pub graph: PathBuf,
    pub aux: Vec<PathBuf>,
}

/// Result of a consolidation pass.
pub struct ConsolidatedVisual {
    pub bytes_written: u64,
    /// Native square input resolution, when the graph declares a concrete
    /// `1x3xSxS` input shape.
    pub input_size: Option<u32>,
}

/// Inline all external tensor data into the staged graph and write the
/// self-contained artifact to `dest`.
pub fn consolidate(staged: &StagedVisual, dest: &Path) -> Result<ConsolidatedVisual> {
    let bytes = fs::read(&staged.graph)
        .with_context(|| format!("failed to read staged graph {}", staged.graph.display()))?;
    let mut model = onnx::ModelProto::decode(bytes.as_slice())
        .with_context(|| format!("failed to decode ONNX graph {}", staged.graph.display()))?;

    // External-data locations are recorded relative to the graph file.
    let base_dir = staged.graph.parent().unwrap_or_else(|| Path::new("."));
    if let Some(graph) = model.graph.as_mut() {
        inline_graph(graph, base_dir)?;
    }

    let mut buf = Vec::with_capacity(model.encoded_len());
    model
        .encode(&mut buf)
        .context("failed to re-encode consolidated graph")?;
    fs::write(dest, &buf)
        .with_context(|| format!("failed to write visual artifact {}", dest.display()))?;

    let input_size = model.graph.as_ref().and_then(probe_input_size);
    Ok(ConsolidatedVisual {
        bytes_written: buf.len() as u64,
        input_size,
    })
}

/// Remove the staging files. Failure here never fails the export; the
/// artifact is already written.
pub fn cleanup_staging(staged: &StagedVisual) {
    for path in std::iter::once(&staged.graph).chain(staged.aux.iter()) {
        if let Err(e) = fs::remove_file(path) {
            warn!("failed to remove staging file {}: {e}", path.display());
        }
    }
    if let Some(dir) = staged.graph.parent() {
        let _ = fs::remove_dir(dir);
    }
}

fn inline_graph(graph: &mut onnx::GraphProto, base_dir: &Path) -> Result<()> {
    for tensor in &mut graph.initializer {
        inline_tensor(tensor, base_dir)?;
    }
    // Subgraphs carried in node attributes can hold initializers of their own.
    for node in &mut graph.node {
        for attribute in &mut node.attribute {
            if let Some(tensor) = attribute.t.as_mut() {
                inline_tensor(tensor, base_dir)?;
            }
            for tensor in &mut attribute.tensors {
                inline_tensor(tensor, base_dir)?;
            }
            if let Some(subgraph) = attribute.g.as_mut() {
                inline_graph(subgraph, base_dir)?;
            }
            for subgraph in &mut attribute.graphs {
                inline_graph(subgraph, base_dir)?;
            }
        }
    }
    Ok(())
}

/// Move one tensor's externally-stored bytes into `raw_data`.
fn inline_tensor(tensor: &mut onnx::TensorProto, base_dir: &Path) -> Result<()> {
    if tensor.data_location != onnx::tensor_proto::DataLocation::External as i32 {
        return Ok(());
    }

    let mut location = None;
    let mut seg_offset: u64 = 0;
    let mut seg_length: Option<u64> = None;
    for entry in &tensor.external_data {
        match entry.key.as_str() {
            "location" => location = Some(entry.value.clone()),
            "offset" => {
                seg_offset = entry
                    .value
                    .parse()
                    .with_context(|| format!("bad external offset for tensor '{}'", tensor.name))?
            }
            "length" => {
                seg_length = Some(entry.value.parse().with_context(|| {
                    format!("bad external length for tensor '{}'", tensor.name)
                })?)
            }
            _ => {}
        }
    }
    let location =
        location.ok_or_else(|| anyhow!("external tensor '{}' has no location", tensor.name))?;

    let segment_path = base_dir.join(&location);
    let data = fs::read(&segment_path).with_context(|| {
        format!(
            "failed to read external data {} for tensor '{}'",
            segment_path.display(),
            tensor.name
        )
    })?;

    let start = seg_offset as usize;
    let end = match seg_length {
        Some(len) => start
            .checked_add(len as usize)
            .ok_or_else(|| anyhow!("external segment for '{}' overflows", tensor.name))?,
        None => data.len(),
    };
    if start > end || end > data.len() {
        bail!(
            "external segment {}..{} for tensor '{}' is outside {} ({} bytes)",
            start,
            end,
            tensor.name,
            segment_path.display(),
            data.len()
        );
    }

    tensor.raw_data = data[start..end].to_vec();
    tensor.external_data.clear();
    tensor.data_location = onnx::tensor_proto::DataLocation::Default as i32;
    Ok(())
}

/// Read the square input resolution from a concrete `1x3xSxS` input shape.
fn probe_input_size(graph: &onnx::GraphProto) -> Option<u32> {
    let input = graph.input.first()?;
    let tensor = match input.r#type.as_ref()?.value.as_ref()? {
        onnx::type_proto::Value::TensorType(tensor) => tensor,
        _ => return None,
    };
    let shape = tensor.shape.as_ref()?;
    if shape.dim.len() != 4 {
        return None;
    }

    let concrete = |d: &onnx::tensor_shape_proto::Dimension| match d.value.as_ref() {
        Some(onnx::tensor_shape_proto::dimension::Value::DimValue(v)) if *v > 0 => Some(*v),
        _ => None,
    };
    let height = concrete(&shape.dim[2])?;
    let width = concrete(&shape.dim[3])?;
    if height == width {
        Some(height as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("triage-export-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn entry(key: &str, value: &str) -> onnx::StringStringEntryProto {
        onnx::StringStringEntryProto {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn dim(v: i64) -> onnx::tensor_shape_proto::Dimension {
        onnx::tensor_shape_proto::Dimension {
            value: Some(onnx::tensor_shape_proto::dimension::Value::DimValue(v)),
            ..Default::default()
        }
    }

    fn image_input(name: &str, dims: &[i64]) -> onnx::ValueInfoProto {
        onnx::ValueInfoProto {
            name: name.to_string(),
            r#type: Some(onnx::TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                    elem_type: onnx::tensor_proto::DataType::Float as i32,
                    shape: Some(onnx::TensorShapeProto {
                        dim: dims.iter().map(|&v| dim(v)).collect(),
                    }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn external_tensor(name: &str, location: &str, offset: u64, length: u64) -> onnx::TensorProto {
        onnx::TensorProto {
            name: name.to_string(),
            dims: vec![4, 4],
            data_type: onnx::tensor_proto::DataType::Float as i32,
            data_location: onnx::tensor_proto::DataLocation::External as i32,
            external_data: vec![
                entry("location", location),
                entry("offset", &offset.to_string()),
                entry("length", &length.to_string()),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_consolidate_inlines_external_segments() {
        let dir = scratch_dir("consolidate");

        let payload: Vec<u8> = (0..64).collect();
        let mut segment_file = vec![0xAA; 8];
        segment_file.extend_from_slice(&payload);
        segment_file.extend_from_slice(&[0xBB; 4]);
        fs::write(dir.join("weights.bin"), &segment_file).unwrap();

        let model = onnx::ModelProto {
            ir_version: 8,
            graph: Some(onnx::GraphProto {
                name: "visual".to_string(),
                input: vec![image_input("input", &[1, 3, 256, 256])],
                initializer: vec![external_tensor("visual.weight", "weights.bin", 8, 64)],
                ..Default::default()
            }),
            ..Default::default()
        };

        let graph_path = dir.join("temp_visual.onnx");
        let mut encoded = Vec::new();
        model.encode(&mut encoded).unwrap();
        fs::write(&graph_path, &encoded).unwrap();

        let staged = StagedVisual {
            graph: graph_path,
            aux: vec![dir.join("weights.bin")],
        };
        let dest = dir.join("visual.onnx");
        let result = consolidate(&staged, &dest).unwrap();

        assert_eq!(result.input_size, Some(256));
        assert_eq!(result.bytes_written, fs::metadata(&dest).unwrap().len());

        let merged = onnx::ModelProto::decode(fs::read(&dest).unwrap().as_slice()).unwrap();
        let merged_graph = merged.graph.unwrap();
        let tensor = &merged_graph.initializer[0];
        assert_eq!(tensor.raw_data, payload, "segment bytes must be inlined");
        assert!(tensor.external_data.is_empty());
        assert_eq!(
            tensor.data_location,
            onnx::tensor_proto::DataLocation::Default as i32
        );

        cleanup_staging(&staged);
        assert!(!staged.graph.exists());
        assert!(!staged.aux[0].exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_consolidate_passes_through_self_contained_graph() {
        let dir = scratch_dir("passthrough");

        let inline = onnx::TensorProto {
            name: "visual.bias".to_string(),
            dims: vec![2],
            data_type: onnx::tensor_proto::DataType::Float as i32,
            raw_data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            ..Default::default()
        };
        let model = onnx::ModelProto {
            ir_version: 8,
            graph: Some(onnx::GraphProto {
                name: "visual".to_string(),
                initializer: vec![inline.clone()],
                ..Default::default()
            }),
            ..Default::default()
        };

        let graph_path = dir.join("temp_visual.onnx");
        let mut encoded = Vec::new();
        model.encode(&mut encoded).unwrap();
        fs::write(&graph_path, &encoded).unwrap();

        let staged = StagedVisual {
            graph: graph_path,
            aux: Vec::new(),
        };
        let dest = dir.join("visual.onnx");
        let result = consolidate(&staged, &dest).unwrap();
        // No concrete input shape declared.
        assert_eq!(result.input_size, None);

        let merged = onnx::ModelProto::decode(fs::read(&dest).unwrap().as_slice()).unwrap();
        assert_eq!(merged.graph.unwrap().initializer[0].raw_data, inline.raw_data);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_segment_file_is_fatal() {
        let dir = scratch_dir("missing-segment");

        let model = onnx::ModelProto {
            ir_version: 8,
            graph: Some(onnx::GraphProto {
                initializer: vec![external_tensor("visual.weight", "nowhere.bin", 0, 16)],
                ..Default::default()
            }),
            ..Default::default()
        };
        let graph_path = dir.join("temp_visual.onnx");
        let mut encoded = Vec::new();
        model.encode(&mut encoded).unwrap();
        fs::write(&graph_path, &encoded).unwrap();

        let staged = StagedVisual {
            graph: graph_path,
            aux: Vec::new(),
        };
        assert!(consolidate(&staged, &dir.join("visual.onnx")).is_err());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_probe_rejects_symbolic_shape() {
        let graph = onnx::GraphProto {
            input: vec![image_input("input", &[-1, 3, 224, 224])],
            ..Default::default()
        };
        // Batch is symbolic (-1) but spatial dims are concrete and square.
        assert_eq!(probe_input_size(&graph), Some(224));

        let graph = onnx::GraphProto {
            input: vec![image_input("input", &[1, 3, -1, -1])],
            ..Default::default()
        };
        assert_eq!(probe_input_size(&graph), None);
    }
}
