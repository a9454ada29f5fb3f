//! Mapping rule compiler and transfer engine.
//!
//! A mapping is declared as a nested list of rules:
//!
//! ```toml
//! req = [
//!     ["http", "", [
//!         ["body[]", "posts[]", [
//!             ["post_id", "post_id"],
//!             ["title", "title"],
//!         ]],
//!     ]],
//! ]
//! ```
//!
//! A two-element rule copies one primitive, a three-element rule opens an object or array level
//! on either side. [`MappingRuleRaw::to_converter`] compiles the rules into a tree of
//! [`LevelPair`]s which [`ModelConverter::transfer`] walks depth first.

use crate::error::{DefinitionError, DefinitionResult};
use crate::model::{DataInstance, ModelResult, ObjectNode, SourceRef, ensure_array_element};
use crate::path;
use error_stack::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Declarative mapping rules, as read from a definition file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingRuleRaw(pub Vec<Value>);

impl MappingRuleRaw {
    pub fn new(rules: Vec<Value>) -> Self {
        Self(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_converter(&self) -> DefinitionResult<ModelConverter> {
        let mut converter = ModelConverter::default();
        for (idx, rule) in self.0.iter().enumerate() {
            let pair = compile_rule(rule, &[], &[], &mut converter)
                .map_err(|e| Report::new(e).attach(format!("mapping rule #{idx}: {rule}")))?;
            converter.level_pairs.push(pair);
        }
        Ok(converter)
    }
}

/// One compiled level of a mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelPair {
    pub leaf: bool,
    pub subs: Vec<LevelPair>,

    pub src: String,
    pub src_name: String,
    pub src_array: bool,
    pub dst: String,
    pub dst_name: String,
    pub dst_array: bool,
}

impl LevelPair {
    fn is_primitive_array(&self) -> bool {
        self.src_array && self.dst_array
    }

    fn object_level(src: &str, dst: &str, subs: Vec<LevelPair>) -> Self {
        Self {
            leaf: false,
            subs,
            src: src.to_string(),
            src_name: src.to_string(),
            src_array: false,
            dst: dst.to_string(),
            dst_name: dst.to_string(),
            dst_array: false,
        }
    }
}

/// Compiled mapping. Immutable after load and shared across invocations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelConverter {
    source_leaf_paths: Vec<String>,
    target_leaf_paths: Vec<String>,
    level_pairs: Vec<LevelPair>,
}

impl ModelConverter {
    /// Full source paths of every leaf, aligned with [`Self::target_leaf_paths`].
    pub fn source_leaf_paths(&self) -> &[String] {
        &self.source_leaf_paths
    }

    pub fn target_leaf_paths(&self) -> &[String] {
        &self.target_leaf_paths
    }

    /// `(source, target)` full paths of every leaf.
    pub fn leaf_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.source_leaf_paths
            .iter()
            .map(String::as_str)
            .zip(self.target_leaf_paths.iter().map(String::as_str))
    }

    pub fn level_pairs(&self) -> &[LevelPair] {
        &self.level_pairs
    }

    pub fn is_empty(&self) -> bool {
        self.level_pairs.is_empty()
    }

    /// Top-level source fields read by a transfer. Levels present only on the destination side
    /// contribute the fields read beneath them.
    pub fn source_roots(&self) -> BTreeSet<&str> {
        fn collect<'a>(pairs: &'a [LevelPair], roots: &mut BTreeSet<&'a str>) {
            for pair in pairs {
                if pair.src_name.is_empty() {
                    collect(&pair.subs, roots);
                } else {
                    roots.insert(&pair.src_name);
                }
            }
        }
        let mut roots = BTreeSet::new();
        collect(&self.level_pairs, &mut roots);
        roots
    }

    /// Moves data from `src` into `dst` following the compiled levels.
    pub fn transfer(&self, src: SourceRef<'_>, dst: &mut ObjectNode) -> ModelResult<()> {
        for pair in &self.level_pairs {
            do_transfer(pair, src, dst)?;
        }
        Ok(())
    }

    /// Instance-level [`Self::transfer`]. Fails when `dst` is read-only.
    pub fn transfer_instance(
        &self,
        src: &dyn DataInstance,
        dst: &mut dyn DataInstance,
    ) -> ModelResult<()> {
        self.transfer(src.source(), dst.target()?)
    }
}

fn do_transfer(pair: &LevelPair, src: SourceRef<'_>, dst: &mut ObjectNode) -> ModelResult<()> {
    if pair.leaf {
        return if pair.is_primitive_array() {
            src.transfer_primitive_array(&pair.src_name, &pair.dst_name, dst)
        } else {
            src.transfer_value(&pair.src_name, &pair.dst_name, dst)
        };
    }

    if pair.src.is_empty() {
        let new_dst = dst.ensure_sub_object(&pair.dst_name)?;
        return pair
            .subs
            .iter()
            .try_for_each(|sub| do_transfer(sub, src, new_dst));
    }

    if pair.dst.is_empty() {
        let Some(new_src) = src.sub_object(&pair.src_name)? else {
            return Ok(());
        };
        return pair
            .subs
            .iter()
            .try_for_each(|sub| do_transfer(sub, new_src, dst));
    }

    if pair.src_array && pair.dst_array {
        let Some(src_arr) = src.sub_array(&pair.src_name)? else {
            return Ok(());
        };
        let dst_arr = dst.ensure_sub_array_with_object_elem(&pair.dst_name)?;
        return src_arr.for_each_element(|src_elem| {
            let dst_elem = ensure_array_element(dst_arr);
            pair.subs
                .iter()
                .try_for_each(|sub| do_transfer(sub, src_elem, dst_elem))
        });
    }

    let Some(src_obj) = src.sub_object(&pair.src_name)? else {
        return Ok(());
    };
    let dst_obj = dst.ensure_sub_object(&pair.dst_name)?;
    pair.subs
        .iter()
        .try_for_each(|sub| do_transfer(sub, src_obj, dst_obj))
}

fn rule_path<'a>(rule: &'a [Value], idx: usize, side: &str) -> Result<&'a str, DefinitionError> {
    rule[idx].as_str().ok_or_else(|| {
        DefinitionError::InvalidRule(format!("rule element is not string for {side} path"))
    })
}

/// Splits a rule path into segments. Only the last segment may carry an array suffix.
fn rule_segments(full_path: &str) -> Result<Vec<&str>, DefinitionError> {
    if full_path.is_empty() {
        return Ok(Vec::new());
    }
    if !path::validate_full_path_of_definition(full_path) {
        return Err(DefinitionError::InvalidPath(full_path.to_string()));
    }
    let segments = path::split_full_path(full_path);
    let intermediates = &segments[..segments.len() - 1];
    if intermediates.iter().any(|s| path::is_path_array(s)) {
        return Err(DefinitionError::InvalidRule(format!(
            "array segment is only allowed at the end of a path: {full_path}"
        )));
    }
    Ok(segments)
}

fn compile_rule(
    rule: &Value,
    src_prefix: &[String],
    dst_prefix: &[String],
    converter: &mut ModelConverter,
) -> Result<LevelPair, DefinitionError> {
    let rule = rule
        .as_array()
        .ok_or_else(|| DefinitionError::InvalidRule("sub rule is not rule definition".into()))?;
    if rule.len() != 2 && rule.len() != 3 {
        return Err(DefinitionError::InvalidRule(
            "rule element size is not 2/3 which means not direct or object/array assignment".into(),
        ));
    }

    let src = rule_path(rule, 0, "source")?;
    let dst = rule_path(rule, 1, "destination")?;
    if src.is_empty() && dst.is_empty() {
        return Err(DefinitionError::InvalidRule(
            "source and destination paths are both empty".into(),
        ));
    }
    let src_segments = rule_segments(src)?;
    let dst_segments = rule_segments(dst)?;
    let (src_last, src_outer) = src_segments
        .split_last()
        .map_or(("", &[][..]), |(last, outer)| (*last, outer));
    let (dst_last, dst_outer) = dst_segments
        .split_last()
        .map_or(("", &[][..]), |(last, outer)| (*last, outer));

    let inner = if rule.len() == 2 {
        if path::is_path_array(src_last) {
            return Err(DefinitionError::InvalidRule(
                "src array is not allowed in direct assignment".into(),
            ));
        }
        if path::is_path_array(dst_last) {
            return Err(DefinitionError::InvalidRule(
                "dst array is not allowed in direct assignment".into(),
            ));
        }
        record_leaf(converter, src_prefix, src, dst_prefix, dst);
        LevelPair {
            leaf: true,
            ..LevelPair::object_level(src_last, dst_last, Vec::new())
        }
    } else {
        let subs = rule[2].as_array().ok_or_else(|| {
            DefinitionError::InvalidRule("rule element is not sub rule for third".into())
        })?;

        let src_array = path::is_path_array(src_last);
        let dst_array = path::is_path_array(dst_last);
        if src_array != dst_array {
            return Err(DefinitionError::InvalidRule("only one side is array".into()));
        }
        let bulk_copy = path::is_array_definition(src_last)
            && path::is_array_definition(dst_last)
            && subs.is_empty();
        if bulk_copy {
            record_leaf(converter, src_prefix, src, dst_prefix, dst);
        }

        let mut next_src = src_prefix.to_vec();
        if !src.is_empty() {
            next_src.push(src.to_string());
        }
        let mut next_dst = dst_prefix.to_vec();
        if !dst.is_empty() {
            next_dst.push(dst.to_string());
        }
        let compiled = subs
            .iter()
            .map(|sub| compile_rule(sub, &next_src, &next_dst, converter))
            .collect::<Result<Vec<_>, _>>()?;

        LevelPair {
            leaf: bulk_copy,
            subs: compiled,
            src: src_last.to_string(),
            src_name: path::extract_array_path(src_last).0.to_string(),
            src_array,
            dst: dst_last.to_string(),
            dst_name: path::extract_array_path(dst_last).0.to_string(),
            dst_array,
        }
    };

    // leading segments become one-sided object levels: source levels outermost so that an
    // absent source skips the branch before any destination level is created
    let wrapped = dst_outer
        .iter()
        .rev()
        .fold(inner, |acc, seg| LevelPair::object_level("", seg, vec![acc]));
    Ok(src_outer
        .iter()
        .rev()
        .fold(wrapped, |acc, seg| LevelPair::object_level(seg, "", vec![acc])))
}

fn record_leaf(
    converter: &mut ModelConverter,
    src_prefix: &[String],
    src: &str,
    dst_prefix: &[String],
    dst: &str,
) {
    let mut src_path = src_prefix.to_vec();
    src_path.push(src.to_string());
    let mut dst_path = dst_prefix.to_vec();
    dst_path.push(dst.to_string());
    converter
        .source_leaf_paths
        .push(path::concat_full_path(&src_path));
    converter
        .target_leaf_paths
        .push(path::concat_full_path(&dst_path));
}
