//! 规则集存储
//!
//! 使用 DashMap 按步骤缓存规则集，规则集在载入时先经过编译器校验。

use crate::compiler::RuleSetCompiler;
use crate::error::{Result, RuleError};
use crate::models::RuleSet;
use crate::pipeline::Stage;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 规则集存储
#[derive(Clone, Default)]
pub struct RuleSetStore {
    rule_sets: Arc<DashMap<Stage, Arc<RuleSet>>>,
}

impl RuleSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rule_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_sets.is_empty()
    }

    /// 载入某一步骤的规则集，已有的会被替换
    #[instrument(skip(self, rule_set), fields(step = stage.number(), name = %rule_set.metadata.name))]
    pub fn load(&self, stage: Stage, rule_set: RuleSet) -> Result<()> {
        RuleSetCompiler::validate(&rule_set)?;

        let rules = rule_set.rules.len();
        if self.rule_sets.insert(stage, Arc::new(rule_set)).is_some() {
            info!(rules, "规则集已替换");
        } else {
            info!(rules, "规则集已载入");
        }
        Ok(())
    }

    /// 从 JSON 载入，步骤取自 `metadata.step`
    pub fn load_from_json(&self, json: &str) -> Result<Stage> {
        let rule_set = RuleSet::from_json(json)?;
        let stage = rule_set
            .metadata
            .step
            .and_then(Stage::from_number)
            .ok_or_else(|| {
                RuleError::ParseError(format!(
                    "规则集 '{}' 的 metadata.step 缺失或无效",
                    rule_set.metadata.name
                ))
            })?;

        self.load(stage, rule_set)?;
        Ok(stage)
    }

    /// 载入目录下所有 `*.json` 规则集
    ///
    /// 单个文件失败只记录日志，返回成功载入的步骤。
    #[instrument(skip(self), fields(dir = %dir.display()))]
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<Stage>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut loaded = Vec::with_capacity(paths.len());
        let mut failed = 0;

        for path in &paths {
            let result = std::fs::read_to_string(path)
                .map_err(RuleError::from)
                .and_then(|json| self.load_from_json(&json));

            match result {
                Ok(stage) => loaded.push(stage),
                Err(e) => {
                    failed += 1;
                    warn!(path = %path.display(), error = %e, "规则文件载入失败");
                }
            }
        }

        info!("目录载入完成: {} 成功, {} 失败", loaded.len(), failed);
        Ok(loaded)
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<RuleSet>> {
        self.rule_sets.get(&stage).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.rule_sets.contains_key(&stage)
    }

    pub fn remove(&self, stage: Stage) -> Option<Arc<RuleSet>> {
        self.rule_sets.remove(&stage).map(|(_, r)| r)
    }

    /// 已载入规则集的步骤，按步骤顺序
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.rule_sets.iter().map(|r| *r.key()).collect();
        stages.sort();
        stages
    }

    pub fn clear(&self) {
        let count = self.rule_sets.len();
        self.rule_sets.clear();
        info!("已清空 {} 个规则集", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Operation, Rule};
    use std::thread;

    fn sample(step: u8) -> RuleSet {
        RuleSet::new(
            format!("step-{}", step),
            Some(step),
            vec![Rule::batch("r1", vec![Operation::new("X", "5+3")])],
        )
    }

    #[test]
    fn test_load_and_get() {
        let store = RuleSetStore::new();
        store.load(Stage::FinancialCalculation, sample(2)).unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.contains(Stage::FinancialCalculation));
        assert_eq!(
            store.get(Stage::FinancialCalculation).unwrap().metadata.name,
            "step-2"
        );
        assert!(store.get(Stage::Initialize).is_none());
    }

    #[test]
    fn test_load_rejects_invalid_rule_set() {
        let store = RuleSetStore::new();
        let invalid = RuleSet::new("bad", Some(1), vec![Rule::batch("", vec![])]);
        assert!(store.load(Stage::Initialize, invalid).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_from_json_uses_metadata_step() {
        let store = RuleSetStore::new();
        let json = sample(3).to_json_pretty().unwrap();
        assert_eq!(store.load_from_json(&json).unwrap(), Stage::BillGeneration);

        let no_step = r#"{"metadata": {"name": "x"}, "rules": []}"#;
        assert!(store.load_from_json(no_step).is_err());
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("step1.json"), sample(1).to_json_pretty().unwrap()).unwrap();
        std::fs::write(dir.path().join("step2.json"), sample(2).to_json_pretty().unwrap()).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = RuleSetStore::new();
        let loaded = store.load_dir(dir.path()).unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(
            store.stages(),
            vec![Stage::Initialize, Stage::FinancialCalculation]
        );
    }

    #[test]
    fn test_remove_and_clear() {
        let store = RuleSetStore::new();
        store.load(Stage::Initialize, sample(1)).unwrap();
        store.load(Stage::Finalize, sample(4)).unwrap();

        assert!(store.remove(Stage::Initialize).is_some());
        assert!(store.remove(Stage::Initialize).is_none());

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let store = RuleSetStore::new();
        let handles: Vec<_> = Stage::ALL
            .into_iter()
            .map(|stage| {
                let store = store.clone();
                thread::spawn(move || {
                    store.load(stage, sample(stage.number())).unwrap();
                    store.get(stage).is_some()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(store.len(), 4);
    }
}
