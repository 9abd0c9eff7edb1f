use crate::db_error::Result;
use crate::errplan;
use crate::execution::node::{ExecutableNode, NodeId, NodeKind};
use crate::execution::token::AggMeta;
use crate::sql::SelectQuery;
use crate::types::TableName;

/// 一次查询（或一次 scramble）对应的执行计划 DAG
///
/// 节点按加入顺序编号，订阅的上游必须已经存在，所以图天然无环，
/// 下标顺序就是一个合法的拓扑序。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionPlan {
    nodes: Vec<ExecutableNode>,
    root: Option<NodeId>,
}

impl ExecutionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一个节点并订阅 `upstream` 中的节点，返回新节点的编号
    pub fn add(&mut self, name: impl Into<String>, kind: NodeKind, upstream: &[NodeId]) -> Result<NodeId> {
        let id = self.nodes.len();
        let name = name.into();
        if let Some(missing) = upstream.iter().find(|u| **u >= id) {
            return Err(errplan!("node {name} subscribes to unknown node {missing}"));
        }
        let node = ExecutableNode { id, name, kind, upstream: upstream.to_vec() };
        node.validate()?;
        self.nodes.push(node);
        // 最后加入的节点默认作为根
        self.root = Some(id);
        Ok(id)
    }

    pub fn select(&mut self, name: &str, query: SelectQuery, agg_meta: Option<AggMeta>, upstream: &[NodeId]) -> Result<NodeId> {
        self.add(name, NodeKind::Select { query, agg_meta }, upstream)
    }

    pub fn create_table(
        &mut self,
        name: &str,
        query: SelectQuery,
        target: Option<TableName>,
        agg_meta: Option<AggMeta>,
        upstream: &[NodeId],
    ) -> Result<NodeId> {
        self.add(name, NodeKind::CreateTable { query, target, agg_meta }, upstream)
    }

    pub fn combine(&mut self, name: &str, left: NodeId, right: NodeId) -> Result<NodeId> {
        self.add(name, NodeKind::AggCombiner, &[left, right])
    }

    pub fn drop_table(&mut self, name: &str, upstream: &[NodeId], slot: usize) -> Result<NodeId> {
        self.add(name, NodeKind::DropTable { slot }, upstream)
    }

    pub fn set_root(&mut self, id: NodeId) -> Result<()> {
        if id >= self.nodes.len() {
            return Err(errplan!("root {id} is not a node of the plan"));
        }
        self.root = Some(id);
        Ok(())
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn nodes(&self) -> &[ExecutableNode] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&ExecutableNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
