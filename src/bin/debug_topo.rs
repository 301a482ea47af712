use graphexec::topology::Topology;
use graphexec::{NumaStrategy, PlatformOps, affinity};

fn main() {
    let topo = Topology::detect();
    println!("Detected {} NUMA nodes ({} CPUs)", topo.num_nodes, topo.n_cpus());
    println!("Current node: {}", topo.current_node);
    println!("Core -> Node map: {:?}", topo.core_to_node);
    println!("Node -> Cores map: {:?}", topo.node_cores);
    println!("Running on CPU: {:?}", affinity::default_platform().current_cpu());

    for strategy in [NumaStrategy::Distribute, NumaStrategy::Isolate] {
        let masks: Vec<_> = (0..topo.n_cpus().min(4))
            .map(|ith| topo.numa_mask(&strategy, ith))
            .collect();
        println!("{:?} placement for workers 0..4: {:?}", strategy, masks);
    }
}
