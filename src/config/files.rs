use std::path::{Path, PathBuf};

use figment::{
    Error, Metadata, Profile, Provider,
    value::{Dict, Map, Tag, Value},
};

/// Wraps a provider so that any `<key>_file: <path>` entry also sets `<key>`
/// to the contents of that file. Relative paths resolve against the directory
/// of the config file that named them.
pub struct RecursiveFileProvider<P> {
    inner: P,
}

impl<P> RecursiveFileProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: Provider> Provider for RecursiveFileProvider<P> {
    fn metadata(&self) -> Metadata {
        self.inner.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let base_path = match &self.inner.metadata().source {
            Some(figment::Source::File(path)) => path.parent().map(Path::to_path_buf),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from("."));

        self.inner
            .data()?
            .into_iter()
            .map(|(profile, dict)| Ok((profile, expand_dict(&base_path, dict)?)))
            .collect()
    }

    fn profile(&self) -> Option<Profile> {
        self.inner.profile()
    }
}

fn expand_dict(base_path: &Path, dict: Dict) -> Result<Dict, Error> {
    let mut expanded = Dict::new();

    for (key, value) in dict {
        let value = expand_value(base_path, value)?;

        if let (Some(target), Value::String(_, path)) = (key.strip_suffix("_file"), &value) {
            let path = base_path.join(path);
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| Error::from(format!("Failed to read {}: {e}", path.display())))?;
            expanded.insert(
                target.to_string(),
                Value::String(Tag::Default, contents.trim_end().to_string()),
            );
        }

        expanded.insert(key, value);
    }

    Ok(expanded)
}

fn expand_value(base_path: &Path, value: Value) -> Result<Value, Error> {
    match value {
        Value::Dict(tag, dict) => Ok(Value::Dict(tag, expand_dict(base_path, dict)?)),
        Value::Array(tag, values) => Ok(Value::Array(
            tag,
            values
                .into_iter()
                .map(|v| expand_value(base_path, v))
                .collect::<Result<_, _>>()?,
        )),
        other => Ok(other),
    }
}
