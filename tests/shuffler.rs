mod common {
    use std::io::Write;

    pub fn init() {
        let _ = env_logger::builder()
            .format(|buf, record| writeln!(buf, "{}", record.args()))
            .is_test(true)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use shuffle_store::{PersistenceManager, Shuffler};

    const SIZE: u64 = 111_111;

    const VALIDATE_INTERVAL: u64 = 10_889;

    // Query the given indices, recording both directions of every fresh
    // pair, asserting no value and no index repeats, and validating the
    // tree periodically.
    fn generate<P: PersistenceManager>(
        shuffler: &mut Shuffler<P>,
        indices: impl IntoIterator<Item = u64>,
        index_by_value: &mut [Option<u64>],
        value_by_index: &mut [Option<u64>],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut validate_countdown = 0;

        for index in indices {
            if validate_countdown == 0 {
                shuffler.validate_state()?;
                validate_countdown = VALIDATE_INTERVAL;
            }

            let value = shuffler.value_at(index)?;

            assert_eq!(index_by_value[value as usize], None);
            assert_eq!(value_by_index[index as usize], None);

            index_by_value[value as usize] = Some(index);
            value_by_index[index as usize] = Some(value);

            validate_countdown -= 1;
        }

        shuffler.validate_state()?;

        Ok(())
    }

    // Re-query the given indices and assert every pair is exactly as
    // recorded.
    fn compare<P: PersistenceManager>(
        shuffler: &mut Shuffler<P>,
        indices: impl IntoIterator<Item = u64>,
        index_by_value: &[Option<u64>],
        value_by_index: &[Option<u64>],
    ) -> Result<(), Box<dyn std::error::Error>> {
        for index in indices {
            let value = shuffler.value_at(index)?;

            assert_eq!(index_by_value[value as usize], Some(index));
            assert_eq!(value_by_index[index as usize], Some(value));
        }

        Ok(())
    }

    // Follow the cycle from index 0 and assert it visits every entry
    // exactly once before returning to 0.
    fn assert_cyclic<P: PersistenceManager>(
        shuffler: &mut Shuffler<P>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut visited = vec![false; shuffler.size() as usize];
        let mut index: u64 = 0;

        loop {
            assert!(!visited[index as usize]);

            visited[index as usize] = true;

            index = shuffler.value_at(index)?;

            if index == 0 {
                break;
            }
        }

        for (index, seen) in visited.iter().enumerate() {
            assert!(*seen, "index {} never visited", index);
        }

        Ok(())
    }

    fn repeatable(
        cyclic: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut shuffler = Shuffler::new(SIZE, cyclic)?;

        let mut index_by_value = vec![None; SIZE as usize];
        let mut value_by_index = vec![None; SIZE as usize];

        generate(
            &mut shuffler,
            0..SIZE,
            &mut index_by_value,
            &mut value_by_index,
        )?;
        compare(&mut shuffler, 0..SIZE, &index_by_value, &value_by_index)?;

        if cyclic {
            assert_cyclic(&mut shuffler)?;
        }

        Ok(())
    }

    #[test]
    fn test_repeatable() -> Result<(), Box<dyn std::error::Error>> {
        super::common::init();

        repeatable(false)?;
        repeatable(true)
    }

    fn cyclic_closure(
        sequential: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let mut shuffler = Shuffler::new(SIZE, true)?;

        let mut index_by_value = vec![None; SIZE as usize];
        let mut value_by_index = vec![None; SIZE as usize];

        // Query order should not matter for closure; exercise both index
        // order and a random order drawn from a second shuffler.
        if sequential {
            generate(
                &mut shuffler,
                0..SIZE,
                &mut index_by_value,
                &mut value_by_index,
            )?;
        } else {
            let mut order_shuffler = Shuffler::new(SIZE, false)?;
            let order = order_shuffler
                .iter()
                .collect::<Result<Vec<u64>, _>>()?;
            generate(
                &mut shuffler,
                order,
                &mut index_by_value,
                &mut value_by_index,
            )?;
        }

        let mut visited = vec![false; SIZE as usize];
        let mut value: u64 = 0;

        for _ in 0..SIZE {
            value = shuffler.value_at(value)?;

            assert!(!visited[value as usize]);

            visited[value as usize] = true;
        }

        assert_eq!(value, 0);

        for (index, seen) in visited.iter().enumerate() {
            assert!(*seen, "index {} not part of the cycle", index);
        }

        Ok(())
    }

    #[test]
    fn test_cyclic() -> Result<(), Box<dyn std::error::Error>> {
        super::common::init();

        cyclic_closure(true)?;
        cyclic_closure(false)
    }

    fn iterable(cyclic: bool) -> Result<(), Box<dyn std::error::Error>> {
        let mut shuffler = Shuffler::new(SIZE, cyclic)?;

        shuffler.validate_state()?;

        let values = shuffler.iter().collect::<Result<Vec<u64>, _>>()?;

        let mut index_by_value = vec![None; SIZE as usize];
        let mut value_by_index = vec![None; SIZE as usize];
        let mut index: u64 = 0;

        for value in values {
            assert_eq!(index_by_value[value as usize], None);
            assert_eq!(value_by_index[index as usize], None);

            // The iterator must agree with direct queries.
            assert_eq!(value, shuffler.value_at(index)?);

            index_by_value[value as usize] = Some(index);
            value_by_index[index as usize] = Some(value);

            index = if !cyclic { index + 1 } else { value };
        }

        assert_eq!(index, if !cyclic { SIZE } else { 0 });

        assert!(index_by_value.iter().all(|entry| entry.is_some()));
        assert!(value_by_index.iter().all(|entry| entry.is_some()));

        if cyclic {
            assert_cyclic(&mut shuffler)?;
        }

        Ok(())
    }

    #[test]
    fn test_iterable() -> Result<(), Box<dyn std::error::Error>> {
        super::common::init();

        iterable(false)?;
        iterable(true)
    }

    #[test]
    fn test_persistence_manager(
    ) -> Result<(), Box<dyn std::error::Error>> {
        super::common::init();

        let size_3_4 = SIZE * 3 / 4;

        let mut index_by_value = vec![None; SIZE as usize];
        let mut value_by_index = vec![None; SIZE as usize];

        let mut shuffler1 = Shuffler::new(SIZE, false)?;

        generate(
            &mut shuffler1,
            0..size_3_4,
            &mut index_by_value,
            &mut value_by_index,
        )?;

        // A second shuffler over the same store continues where the first
        // stopped: every recorded pair survives, the remainder fills in
        // without duplicates.
        let mut shuffler2 = Shuffler::with_persistence(
            SIZE,
            false,
            shuffler1.into_persistence(),
        )?;

        compare(
            &mut shuffler2,
            0..size_3_4,
            &index_by_value,
            &value_by_index,
        )?;
        generate(
            &mut shuffler2,
            size_3_4..SIZE,
            &mut index_by_value,
            &mut value_by_index,
        )?;
        compare(&mut shuffler2, 0..SIZE, &index_by_value, &value_by_index)?;

        Ok(())
    }

    fn resize_cascade(
        cyclic: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        // A size-20 tree is a single terminal root; growing to 200 forces
        // a non-terminal root above it.
        let mut terminal_to_non_terminal = Shuffler::new(20, cyclic)?;
        terminal_to_non_terminal.validate_state()?;
        terminal_to_non_terminal.resize(200)?;
        terminal_to_non_terminal.validate_state()?;

        let mut test_size: u64 = 20;

        let mut shuffler = Shuffler::new(test_size, cyclic)?;
        let mut pairs: HashMap<u64, u64> = HashMap::new();

        for resize_index in 0..20 {
            for index in test_size / 2..test_size {
                pairs.insert(index, shuffler.value_at(index)?);
            }

            shuffler.validate_state()?;

            // Add 50% to the size each time.
            test_size = test_size * 3 / 2;

            shuffler.resize(test_size)?;

            if resize_index % 2 == 0 {
                // Recreate the shuffler to test persistence of the
                // resize.
                shuffler = Shuffler::with_persistence(
                    test_size,
                    cyclic,
                    shuffler.into_persistence(),
                )?;
            }

            shuffler.validate_state()?;

            for (&index, &value) in &pairs {
                assert_eq!(shuffler.value_at(index)?, value);
                assert_eq!(shuffler.index_of(value)?, Some(index));
            }
        }

        if !cyclic {
            // Consume the entire range; a consumed non-cyclic shuffler
            // can still grow.
            for index in 0..test_size {
                shuffler.value_at(index)?;
            }

            shuffler.resize(test_size + 1)?;
        } else {
            // The cyclic assertion consumes the entire range, after
            // which the shuffler can no longer be resized.
            assert_cyclic(&mut shuffler)?;

            assert!(shuffler.resize(test_size + 1).is_err());
        }

        Ok(())
    }

    #[test]
    fn test_resize() -> Result<(), Box<dyn std::error::Error>> {
        super::common::init();

        resize_cascade(false)?;
        resize_cascade(true)
    }

    #[test]
    fn test_small_range_permutation(
    ) -> Result<(), Box<dyn std::error::Error>> {
        super::common::init();

        let mut shuffler = Shuffler::new(10, false)?;
        let mut values = Vec::new();

        for index in 0..10 {
            let value = shuffler.value_at(index)?;
            assert_eq!(shuffler.index_of(value)?, Some(index));
            values.push(value);
        }

        values.sort_unstable();
        assert_eq!(values, (0..10).collect::<Vec<u64>>());

        Ok(())
    }

    #[test]
    fn test_small_range_cycle() -> Result<(), Box<dyn std::error::Error>>
    {
        super::common::init();

        let mut shuffler = Shuffler::new(10, true)?;
        let mut path = vec![0u64];

        loop {
            let next = shuffler.value_at(*path.last().ok_or("empty path")?)?;
            if next == 0 {
                break;
            }
            path.push(next);
        }

        assert_eq!(path.len(), 10);

        path.sort_unstable();
        assert_eq!(path, (0..10).collect::<Vec<u64>>());

        Ok(())
    }
}
