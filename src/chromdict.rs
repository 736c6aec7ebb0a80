use rustc_hash::FxHashMap;

/// Chromosome id <-> name mapping shared by all species.
///
/// A chromosome id is the position of its name in the on-disk name table.
/// The same textual name may occur more than once; lookups by name resolve
/// to the first occurrence.
#[derive(Clone, Debug, Default)]
pub struct ChromDict {
    names: Vec<String>,
    name_to_id: FxHashMap<String, u16>,
}

impl ChromDict {
    pub fn new() -> Self {
        ChromDict::default()
    }

    pub fn from_names(names: Vec<String>) -> Self {
        let mut name_to_id = FxHashMap::default();
        for (id, name) in names.iter().enumerate() {
            name_to_id.entry(name.clone()).or_insert(id as u16);
        }
        ChromDict { names, name_to_id }
    }

    pub fn id_from_name(&self, name: &str) -> Option<u16> {
        self.name_to_id.get(name).copied()
    }

    pub fn name(&self, id: u16) -> Option<&str> {
        self.names.get(id as usize).map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
