//! 候选序列：模型列表与端点列表
//!
//! 主选项在前，其后按配置顺序追加 fallback，跳过与已有项重复的条目。构建后不可变。

/// 一次逻辑请求的候选（模型、端点各一张有序表）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateList {
    models: Vec<String>,
    endpoints: Vec<String>,
}

impl CandidateList {
    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// (模型, 端点) 组合总数
    pub fn len(&self) -> usize {
        self.models.len() * self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按「端点在外、模型在内」的顺序展开，附带扁平序号
    pub fn pairs(&self) -> impl Iterator<Item = (usize, &str, &str)> + '_ {
        self.endpoints
            .iter()
            .flat_map(move |endpoint| {
                self.models
                    .iter()
                    .map(move |model| (model.as_str(), endpoint.as_str()))
            })
            .enumerate()
            .map(|(index, (model, endpoint))| (index, model, endpoint))
    }
}

pub struct CandidateSequencer;

impl CandidateSequencer {
    pub fn build_model_candidates(primary: &str, fallback_pool: &[String]) -> Vec<String> {
        Self::ordered(primary, fallback_pool)
    }

    pub fn build_endpoint_candidates(primary: &str, fallback_pool: &[String]) -> Vec<String> {
        Self::ordered(primary, fallback_pool)
    }

    pub fn build(
        primary_model: &str,
        fallback_models: &[String],
        primary_endpoint: &str,
        fallback_endpoints: &[String],
    ) -> CandidateList {
        CandidateList {
            models: Self::build_model_candidates(primary_model, fallback_models),
            endpoints: Self::build_endpoint_candidates(primary_endpoint, fallback_endpoints),
        }
    }

    fn ordered(primary: &str, pool: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(pool.len() + 1);
        out.push(primary.to_string());
        for entry in pool {
            if !out.iter().any(|existing| existing == entry) {
                out.push(entry.clone());
            }
        }
        out
    }
}
