//! Per-run embedding map: numeric keys the kernel can refer to host-side
//! strings and objects by.

use std::any::Any;
use std::collections::HashMap;

/// Exception names the runtime may raise before the host has embedded
/// anything; their string ids are fixed by position in this table.
pub const RUNTIME_EXCEPTION_NAMES: &[&str] = &[
    "RTIOUnderflow",
    "RTIOOverflow",
    "RTIODestinationUnreachable",
    "DMAError",
    "I2CError",
    "CacheError",
    "SPIError",
    "SubkernelError",
    "0:AssertionError",
    "0:AttributeError",
    "0:IndexError",
    "0:IOError",
    "0:KeyError",
    "0:NotImplementedError",
    "0:OverflowError",
    "0:RuntimeError",
    "0:TimeoutError",
    "0:TypeError",
    "0:ValueError",
    "0:ZeroDivisionError",
    "0:LinAlgError",
    "UnwrapNoneError",
];

/// String and object arena for one kernel run.
///
/// Keys only ever grow; a key handed to the kernel stays valid for the whole
/// run even if the host drops its own reference.
pub struct EmbeddingMap {
    next_object_key: u32,
    objects: HashMap<u32, Box<dyn Any + Send>>,
    strings: Vec<String>,
    string_ids: HashMap<String, u32>,
}

impl EmbeddingMap {
    pub fn new() -> EmbeddingMap {
        let mut map = EmbeddingMap {
            next_object_key: 0,
            objects: HashMap::new(),
            strings: Vec::new(),
            string_ids: HashMap::new(),
        };
        for name in RUNTIME_EXCEPTION_NAMES {
            let qualified = if name.contains(':') {
                name.to_string()
            } else {
                format!("0:{name}")
            };
            map.store_str(&qualified);
        }
        map
    }

    /// Intern a string; the same string always gets the same id.
    pub fn store_str(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    pub fn retrieve_str(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    pub fn store_object(&mut self, object: Box<dyn Any + Send>) -> u32 {
        let key = self.next_object_key;
        self.next_object_key += 1;
        self.objects.insert(key, object);
        key
    }

    pub fn retrieve_object(&self, key: u32) -> Option<&(dyn Any + Send)> {
        self.objects.get(&key).map(Box::as_ref)
    }
}

impl Default for EmbeddingMap {
    fn default() -> Self {
        EmbeddingMap::new()
    }
}
