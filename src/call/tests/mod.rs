mod scenarios_test;
