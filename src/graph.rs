//! Dependency ordering shared by the stage planner and service start order.

/// Order `count` nodes so every node comes after its dependencies.
///
/// `deps(i)` lists the indices node `i` depends on. Among nodes that are
/// ready at the same time the lowest index wins, so callers control ties by
/// how they order their input. A cycle is reported with the indices that
/// could not be placed.
pub fn topo_order<F>(count: usize, deps: F) -> Result<Vec<usize>, Vec<usize>>
where
    F: Fn(usize) -> Vec<usize>,
{
    let edges: Vec<Vec<usize>> = (0..count).map(&deps).collect();
    let mut placed = vec![false; count];
    let mut order = Vec::with_capacity(count);

    while order.len() < count {
        let next = (0..count)
            .find(|&i| !placed[i] && edges[i].iter().all(|&d| d == i || placed[d]));
        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                return Err((0..count).filter(|&i| !placed[i]).collect());
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_come_first() {
        // 0 depends on 2, 1 on nothing, 2 on 1
        let deps = [vec![2], vec![], vec![1]];
        assert_eq!(topo_order(3, |i| deps[i].clone()).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn independent_nodes_keep_input_order() {
        assert_eq!(topo_order(4, |_| vec![]).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cycles_are_reported() {
        let deps = [vec![1], vec![0], vec![]];
        assert_eq!(topo_order(3, |i| deps[i].clone()).unwrap_err(), vec![0, 1]);
    }
}
