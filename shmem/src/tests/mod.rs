mod torn_read_tests;
