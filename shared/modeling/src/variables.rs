use tch::nn::VarStore;
use tch::Tensor;

/// All named variables of a store, sorted by name.
///
/// Collective operations are position-sensitive: every rank must reduce its
/// gradients in the same order, and the optimizer must register parameters
/// in the same order, or replicas silently diverge. Hash-map iteration
/// order is not that guarantee; this is.
pub fn stable_variables(vs: &VarStore) -> Vec<(String, Tensor)> {
    let mut vars: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    #[test]
    fn test_variables_are_name_sorted() {
        let vs = VarStore::new(Device::Cpu);
        let root = vs.root();
        let _c = root.var("c_last", &[2], nn::Init::Const(0.0));
        let _a = root.var("a_first", &[2], nn::Init::Const(0.0));
        let _b = root.var("b_middle", &[2], nn::Init::Const(0.0));

        let names: Vec<String> = stable_variables(&vs).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a_first", "b_middle", "c_last"]);
    }
}
