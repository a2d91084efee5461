//! Probe-site discovery.
//!
//! Finds the user functions worth tracing in a Go binary and, for each of
//! them, the byte offsets the uprobe generator has to attach to: every
//! return instruction and the prologue call into the stack-growth routine.

use crate::config::ResolveOptions;
use crate::error::{ManifestError, ResolveError};
use crate::scanner::{InstructionScanner, X86_64Scanner};
use crate::symbol_table::{CodeSection, RawSymbol, SymbolTable};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    io::{Read, Write},
    path::Path,
};

/// One instrumentable function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSite {
    pub name: String,
    pub index: u32,
    pub entry_address: u64,
    pub size: u64,
    /// Offsets of every return instruction, relative to `entry_address`
    pub return_offsets: Vec<u64>,
    /// Offset of the call into the stack-growth routine, if the prologue has one
    pub growth_check_offset: Option<u64>,
}

impl FunctionSite {
    /// A function without return probes can never close a frame
    pub fn can_exit(&self) -> bool {
        !self.return_offsets.is_empty()
    }
}

/// Resolved probe sites, indexed both by dense function index and by name
#[derive(Debug, Clone, Default)]
pub struct ProbeSites {
    sites: Vec<FunctionSite>,
    by_name: HashMap<String, u32>,
}

impl ProbeSites {
    fn push(&mut self, mut site: FunctionSite) -> u32 {
        let index = self.sites.len() as u32;
        site.index = index;
        self.by_name.insert(site.name.clone(), index);
        self.sites.push(site);
        index
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&FunctionSite> {
        self.sites.get(index as usize)
    }

    pub fn by_name(&self, name: &str) -> Option<&FunctionSite> {
        self.by_name.get(name).and_then(|&index| self.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionSite> {
        self.sites.iter()
    }

    /// Function names in index order; position `i` holds the name of index `i`
    pub fn index_to_name(&self) -> Vec<String> {
        self.sites.iter().map(|site| site.name.clone()).collect()
    }

    /// Functions that will never produce exit events
    pub fn without_exits(&self) -> impl Iterator<Item = &FunctionSite> {
        self.sites.iter().filter(|site| !site.can_exit())
    }

    pub fn to_manifest(&self) -> ProbeManifest {
        ProbeManifest {
            index_to_name: self
                .sites
                .iter()
                .map(|site| (site.index, site.name.clone()))
                .collect(),
            name_to_site: self
                .sites
                .iter()
                .map(|site| {
                    (
                        site.name.clone(),
                        SiteEntry {
                            return_offsets: site.return_offsets.clone(),
                            growth_check_offset: site.growth_check_offset,
                            entry_address: site.entry_address,
                            size: site.size,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn from_manifest(manifest: ProbeManifest) -> Result<Self, ManifestError> {
        let mut sites = ProbeSites::default();
        let mut name_to_site = manifest.name_to_site;
        for (expected, (index, name)) in (0u32..).zip(manifest.index_to_name) {
            if index != expected {
                return Err(ManifestError::SparseIndex { expected, found: index });
            }
            let entry = name_to_site
                .remove(&name)
                .ok_or_else(|| ManifestError::MissingSite(name.clone()))?;
            sites.push(FunctionSite {
                name,
                index,
                entry_address: entry.entry_address,
                size: entry.size,
                return_offsets: entry.return_offsets,
                growth_check_offset: entry.growth_check_offset,
            });
        }
        for name in name_to_site.keys() {
            warn!("Manifest has a site for {} but no index, ignoring it", name);
        }
        Ok(sites)
    }

    pub fn write_manifest<W: Write>(&self, writer: W) -> Result<(), ManifestError> {
        serde_json::to_writer_pretty(writer, &self.to_manifest())?;
        Ok(())
    }

    pub fn read_manifest<R: Read>(reader: R) -> Result<Self, ManifestError> {
        let manifest: ProbeManifest = serde_json::from_reader(reader)?;
        Self::from_manifest(manifest)
    }
}

/// Serialized form handed to the instrumentation generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeManifest {
    pub index_to_name: BTreeMap<u32, String>,
    pub name_to_site: BTreeMap<String, SiteEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteEntry {
    pub return_offsets: Vec<u64>,
    pub growth_check_offset: Option<u64>,
    #[serde(default)]
    pub entry_address: u64,
    #[serde(default)]
    pub size: u64,
}

/// Compiler-generated symbols that are not user call sites:
/// type descriptors and generic instantiations
fn is_generated_symbol(name: &str) -> bool {
    name.starts_with("type:")
        || name.starts_with("type.")
        || name.starts_with("go:")
        || name.starts_with("go.itab.")
        || name.contains('[')
}

/// A symbol qualifies when it lives under one of `prefixes` and is not a
/// package-level helper such as `main..inittask` or `main..stmp_0`
fn qualifies(name: &str, prefixes: &[String]) -> bool {
    !is_generated_symbol(name)
        && prefixes.iter().any(|prefix| {
            name.strip_prefix(prefix.as_str())
                .is_some_and(|rest| !rest.is_empty() && !rest.starts_with('.'))
        })
}

/// Assembly routines carry an ABI suffix in register-ABI binaries
/// (`runtime.morestack.abi0`)
fn without_abi_suffix(name: &str) -> &str {
    name.strip_suffix(".abi0").unwrap_or(name)
}

/// Resolve probe sites for the binary at `binary`
pub fn resolve<P: AsRef<Path>>(binary: P, options: &ResolveOptions) -> Result<ProbeSites, ResolveError> {
    let table = SymbolTable::read(binary)?;
    let scanner = X86_64Scanner::for_architecture(table.architecture)
        .ok_or_else(|| ResolveError::UnsupportedArchitecture(format!("{:?}", table.architecture)))?;
    resolve_table(&table, options, &scanner)
}

/// Resolve probe sites from an already loaded symbol table
pub fn resolve_table<S: InstructionScanner>(
    table: &SymbolTable,
    options: &ResolveOptions,
    scanner: &S,
) -> Result<ProbeSites, ResolveError> {
    let mut candidates: Vec<(&RawSymbol, &CodeSection)> = Vec::new();
    let mut growth_addresses: HashMap<&str, u64> = HashMap::new();

    for symbol in table.functions() {
        let base_name = without_abi_suffix(&symbol.name);
        if let Some(routine) = options.growth_routines.iter().find(|routine| *routine == base_name) {
            growth_addresses.entry(routine.as_str()).or_insert(symbol.address);
        }
        if !qualifies(&symbol.name, &options.package_prefixes) {
            continue;
        }
        if let Some(section) = symbol.section_index.and_then(|index| table.code_section(index)) {
            candidates.push((symbol, section));
        }
    }

    if candidates.is_empty() {
        return Err(ResolveError::NoMatchingFunctions {
            prefixes: options.package_prefixes.clone(),
        });
    }

    for routine in &options.growth_routines {
        match growth_addresses.get(routine.as_str()) {
            Some(address) => debug!("Stack growth routine {} at 0x{:x}", routine, address),
            None => warn!("Stack growth routine {} not found, its growth frames will not be detected", routine),
        }
    }

    let mut sites = ProbeSites::default();
    for (symbol, section) in candidates {
        if sites.by_name.contains_key(&symbol.name) {
            debug!("Skipping duplicate symbol {} at 0x{:x}", symbol.name, symbol.address);
            continue;
        }

        let code = section.bytes(symbol.address, symbol.size).ok_or_else(|| {
            ResolveError::SymbolOutOfSection {
                name: symbol.name.clone(),
                address: symbol.address,
                size: symbol.size,
                section: section.index,
                section_start: section.address,
                section_end: section.end(),
            }
        })?;

        let mut return_offsets = Vec::new();
        let mut growth_check_offset = None;
        for instruction in scanner.scan(code, symbol.address) {
            let offset = instruction.address - symbol.address;
            if instruction.is_return() {
                return_offsets.push(offset);
            } else if let Some(target) = instruction.call_target() {
                if !growth_addresses.values().any(|&address| address == target) {
                    continue;
                }
                match growth_check_offset {
                    None => growth_check_offset = Some(offset),
                    Some(first) => debug!(
                        "{} calls the stack growth routine again at +0x{:x}, keeping +0x{:x}",
                        symbol.name, offset, first
                    ),
                }
            }
        }

        debug!(
            "{}: {} return sites, growth check {:?}",
            symbol.name,
            return_offsets.len(),
            growth_check_offset
        );

        sites.push(FunctionSite {
            name: symbol.name.clone(),
            index: 0,
            entry_address: symbol.address,
            size: symbol.size,
            return_offsets,
            growth_check_offset,
        });
    }

    info!(
        "Resolved {} functions ({} without return sites)",
        sites.len(),
        sites.without_exits().count()
    );

    Ok(sites)
}
