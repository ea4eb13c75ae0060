use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    hash::{Hash, Hasher},
};

/// Nombres que se tratan como atributos multi-valor: sus valores se
/// concatenan (separados por coma) en vez de pisarse.
pub const MULTI_VALUED: &[&str] = &[
    "resource",
    "storage",
    "filetransfer",
    "environment",
    "candidatehosts",
    "arguments",
];

/// Parámetro nombre/valor de una infraestructura o aplicación.
/// Dos parámetros son iguales si coinciden `(name, value)`; la descripción no cuenta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            description: None,
        }
    }
}

impl PartialEq for Param {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Param {}

impl Hash for Param {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.value.hash(state);
    }
}

fn is_multi_valued(name: &str) -> bool {
    MULTI_VALUED.contains(&name)
}

/// Conjunto efectivo de parámetros de una tarea. Inmutable una vez construido.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EffectiveParams {
    values: HashMap<String, String>,
}

impl EffectiveParams {
    /// Valor único de un parámetro. Vacío cuenta como ausente.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    /// Valores de un parámetro multi-valor, ya separados y sin vacíos.
    pub fn get_list(&self, name: &str) -> Vec<&str> {
        match self.values.get(name) {
            Some(v) => v
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.get(name).map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "true" || v == "yes" || v == "1" => true,
            Some(v) if v == "false" || v == "no" || v == "0" => false,
            _ => default,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Mezcla ordenada de fuentes de parámetros (infraestructura, luego aplicación, ...).
///
/// - Nombres de un solo valor: dentro de una misma fuente gana la primera
///   aparición; entre fuentes, la fuente posterior pisa a la anterior.
/// - Nombres multi-valor (`MULTI_VALUED`): se concatenan todos los valores en
///   orden de mezcla, separados por coma.
pub fn merge(sources: &[&[Param]]) -> EffectiveParams {
    let mut values: HashMap<String, String> = HashMap::new();

    for source in sources {
        let mut seen_here: HashSet<&str> = HashSet::new();

        for p in source.iter() {
            let name = p.name.trim();
            if name.is_empty() {
                continue;
            }

            if is_multi_valued(name) {
                if p.value.trim().is_empty() {
                    continue;
                }
                values
                    .entry(name.to_string())
                    .and_modify(|v| {
                        if !v.is_empty() {
                            v.push(',');
                        }
                        v.push_str(p.value.trim());
                    })
                    .or_insert_with(|| p.value.trim().to_string());
                continue;
            }

            if !seen_here.insert(name) {
                // repetido en la misma fuente: nos quedamos con el primero
                continue;
            }
            values.insert(name.to_string(), p.value.clone());
        }
    }

    EffectiveParams { values }
}
