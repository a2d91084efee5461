use std::collections::HashMap;

/// Deduplicates call paths into dense trace ids, in first-seen order
#[derive(Debug, Default)]
pub struct TraceTable {
    ids: HashMap<Vec<u32>, u32>,
    paths: Vec<Vec<u32>>,
}

impl TraceTable {
    pub fn intern(&mut self, path: Vec<u32>) -> u32 {
        if let Some(&id) = self.ids.get(&path) {
            return id;
        }
        let id = self.paths.len() as u32;
        self.paths.push(path.clone());
        self.ids.insert(path, id);
        id
    }

    pub fn path(&self, id: u32) -> Option<&[u32]> {
        self.paths.get(id as usize).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}
