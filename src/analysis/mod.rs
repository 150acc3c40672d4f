pub mod alias;
pub mod callgraph;
pub mod ir;
