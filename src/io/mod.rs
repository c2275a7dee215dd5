//! File input and output for NPDM artefacts.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{self, format_err};
use bincode;
use serde::{de::DeserializeOwned, Serialize};
use serde_yaml;

pub(crate) mod format;

#[cfg(test)]
#[path = "io_tests.rs"]
mod io_tests;

/// An enumerated type for NPDM file types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NpdmFileType {
    /// Variant for binary files containing dense spin-orbital density matrices.
    Full,

    /// Variant for binary files containing dense spin-summed (spatial) density matrices.
    Spatial,

    /// Variant for binary files containing nonredundant sparse density-matrix elements.
    Sparse,
}

impl NpdmFileType {
    /// Returns the extension of the file type.
    pub fn ext(&self) -> String {
        match self {
            NpdmFileType::Full => "npdm.bin".to_string(),
            NpdmFileType::Spatial => "npdm.spatial.bin".to_string(),
            NpdmFileType::Sparse => "npdm.sparse.bin".to_string(),
        }
    }
}

/// Returns the conventional stem of an NPDM file for a bra/ket state pair.
///
/// # Arguments
///
/// * `directory` - The directory in which the file lives.
/// * `order` - The density-matrix order (`1` gives `onepdm`, `2` gives `twopdm`).
/// * `prefix` - An optional prefix such as `spatial` or `sparse`.
/// * `i` - The bra state index.
/// * `j` - The ket state index.
///
/// # Returns
///
/// The path stem, without extensions.
pub fn npdm_file_stem<P: AsRef<Path>>(
    directory: P,
    order: usize,
    prefix: Option<&str>,
    i: usize,
    j: usize,
) -> PathBuf {
    let name = match order {
        1 => "onepdm".to_string(),
        2 => "twopdm".to_string(),
        n => format!("{n}pdm"),
    };
    let name = match prefix {
        Some(prefix) => format!("{prefix}_{name}"),
        None => name,
    };
    directory.as_ref().join(format!("{name}.{i}.{j}"))
}

/// Appends an extension to a path stem without replacing anything after an existing dot.
///
/// NPDM stems such as `twopdm.0.1` already contain dots, so [`Path::set_extension`] cannot be
/// used on them.
fn append_extension(name: &Path, ext: &str) -> PathBuf {
    let mut path = name.as_os_str().to_owned();
    path.push(".");
    path.push(ext);
    PathBuf::from(path)
}

/// Reads an NPDM binary file and deserialises it into an appropriate structure.
///
/// # Arguments
///
/// * `name` - The name of the file to be read in (without NPDM-specific extensions).
/// * `file_type` - The type of the NPDM file to be read in.
///
/// # Returns
///
/// A `Result` containing the structure deserialised from the read-in file.
pub fn read_npdm_binary<T, P: AsRef<Path>>(
    name: P,
    file_type: NpdmFileType,
) -> Result<T, anyhow::Error>
where
    T: DeserializeOwned,
{
    let path = append_extension(name.as_ref(), &file_type.ext());
    let mut reader = BufReader::new(File::open(path).map_err(|err| format_err!(err))?);
    bincode::deserialize_from(&mut reader).map_err(|err| format_err!(err))
}

/// Serialises a structure and writes into an NPDM binary file.
///
/// # Arguments
///
/// * `name` - The name of the file to be written (without NPDM-specific extensions).
/// * `file_type` - The type of the NPDM file to be written.
///
/// # Returns
///
/// A `Result` indicating if the serialisation and writing processes have been successful.
pub fn write_npdm_binary<T, P: AsRef<Path>>(
    name: P,
    file_type: NpdmFileType,
    value: &T,
) -> Result<(), anyhow::Error>
where
    T: Serialize,
{
    let path = append_extension(name.as_ref(), &file_type.ext());
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, value).map_err(|err| format_err!(err))
}

/// Writes rows of indexed values into a plain-text NPDM file with a `.txt` extension.
///
/// The first line holds the dimension. Every further line holds the indices of one element
/// followed by its value.
pub fn write_npdm_text<P, I>(name: P, dim: usize, rows: I) -> Result<(), anyhow::Error>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = (Vec<usize>, f64)>,
{
    let path = append_extension(name.as_ref(), "txt");
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "{dim}")?;
    for (indices, value) in rows {
        let indices_str = indices
            .iter()
            .map(|idx| format!("{idx:>4}"))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(writer, "{indices_str} {value:>+22.14e}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads an NPDM configuration YAML file and deserialises it into an appropriate structure.
///
/// # Arguments
///
/// * `name` - The name of the file to be read in (with its `.yml` or `.yaml` extension).
///
/// # Returns
///
/// A `Result` containing the structure deserialised from the read-in file.
pub fn read_npdm_yaml<T, P: AsRef<Path>>(name: P) -> Result<T, anyhow::Error>
where
    T: DeserializeOwned,
{
    let mut reader = BufReader::new(File::open(name).map_err(|err| format_err!(err))?);
    serde_yaml::from_reader(&mut reader).map_err(|err| format_err!(err))
}

/// Serialises a structure and writes into an NPDM configuration YAML file.
///
/// # Arguments
///
/// * `name` - The name of the YAML file to be written (without extensions). The resulting file
/// will have the `.yml` extension.
///
/// # Returns
///
/// A `Result` indicating if the serialisation and writing processes have been successful.
pub fn write_npdm_yaml<T, P: AsRef<Path>>(name: P, value: &T) -> Result<(), anyhow::Error>
where
    T: Serialize,
{
    let mut path = name.as_ref().to_path_buf();
    path.set_extension("yml");
    let mut writer = BufWriter::new(File::create(path)?);
    serde_yaml::to_writer(&mut writer, value).map_err(|err| format_err!(err))
}
