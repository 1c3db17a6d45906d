// Binary checkpoint format for layer parameters.
//
// Layout: MAGIC | VERSION | layer type | tensor count (u32) | tensors...
// and every tensor is rank (u32) | dims (u32 each) | len (u32) | f32 LE data.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::ml::Tensor;

/// Magic bytes for file format identification: "MNML"
const MAGIC: &[u8; 4] = b"MNML";
/// Format version
const VERSION: u8 = 2;

// Layer type constants
pub const TYPE_LINEAR: u8 = 1;
pub const TYPE_CONV2D: u8 = 5;

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write a Tensor's raw data to binary format
pub fn write_tensor_data<W: Write>(writer: &mut W, data: &[f32], shape: &[usize]) -> io::Result<()> {
    writer.write_all(&(shape.len() as u32).to_le_bytes())?;
    for &dim in shape {
        writer.write_all(&(dim as u32).to_le_bytes())?;
    }

    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    for &val in data {
        writer.write_all(&val.to_le_bytes())?;
    }

    Ok(())
}

/// Read Tensor data from binary format
pub fn read_tensor_data<R: Read>(reader: &mut R) -> io::Result<(Vec<f32>, Vec<usize>)> {
    let shape_len = read_u32(reader)? as usize;
    let mut shape = Vec::with_capacity(shape_len);
    for _ in 0..shape_len {
        shape.push(read_u32(reader)? as usize);
    }

    let data_len = read_u32(reader)? as usize;
    if data_len != shape.iter().product::<usize>() {
        return Err(invalid(format!(
            "tensor length {data_len} does not match shape {shape:?}"
        )));
    }
    let mut data = Vec::with_capacity(data_len);
    let mut buf = [0u8; 4];
    for _ in 0..data_len {
        reader.read_exact(&mut buf)?;
        data.push(f32::from_le_bytes(buf));
    }

    Ok((data, shape))
}

/// Write header (magic + version + layer type)
pub fn write_header<W: Write>(writer: &mut W, layer_type: u8) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&[VERSION])?;
    writer.write_all(&[layer_type])?;
    Ok(())
}

/// Read and verify header
pub fn read_header<R: Read>(reader: &mut R, expected_type: u8) -> io::Result<()> {
    let mut magic_buf = [0u8; 4];
    reader.read_exact(&mut magic_buf)?;

    if &magic_buf != MAGIC {
        return Err(invalid(
            "Invalid file format: magic bytes mismatch".to_string(),
        ));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;

    if version[0] != VERSION {
        return Err(invalid(format!("Unsupported version: {}", version[0])));
    }

    let mut layer_type = [0u8; 1];
    reader.read_exact(&mut layer_type)?;

    if layer_type[0] != expected_type {
        return Err(invalid(format!(
            "Layer type mismatch: expected {}, got {}",
            expected_type, layer_type[0]
        )));
    }

    Ok(())
}

/// Writes every tensor of one layer into `path`.
pub fn save_layer(path: &Path, layer_type: u8, tensors: &[&Tensor]) -> io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    write_header(&mut writer, layer_type)?;
    writer.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for tensor in tensors {
        write_tensor_data(&mut writer, &tensor.data, &tensor.shape)?;
    }
    writer.flush()
}

/// Reads a layer file back, checking that each tensor keeps the shape of
/// the tensor it replaces.
pub fn load_layer(path: &Path, layer_type: u8, targets: Vec<&mut Tensor>) -> io::Result<()> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    read_header(&mut reader, layer_type)?;
    let count = read_u32(&mut reader)? as usize;
    if count != targets.len() {
        return Err(invalid(format!(
            "expected {} tensors, file holds {count}",
            targets.len()
        )));
    }

    for target in targets {
        let (data, shape) = read_tensor_data(&mut reader)?;
        if shape != target.shape {
            return Err(invalid(format!(
                "shape mismatch: expected {:?}, got {shape:?}",
                target.shape
            )));
        }
        target.data = data;
    }

    Ok(())
}
